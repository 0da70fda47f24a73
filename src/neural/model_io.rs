//! Model I/O via the safetensors format (spec §4.C, ambient stack).
//!
//! Portable across libtorch versions since it sidesteps PyTorch's native
//! pickle-based serialization entirely -- kept close to the teacher's
//! `neural/model_io.rs`, generalized from a `VarStore`-only surface to a
//! plain named-tensor dict so [`crate::neural::manager::ModelManager`]
//! isn't tied to one architecture (spec §1 Non-goals: NN architecture is
//! out of scope).

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use safetensors::{serialize, serialize_to_file};
use tch::{nn, Kind, Tensor};

use crate::error::{CoreError, Result};

fn io_err(msg: impl std::fmt::Display) -> CoreError {
    CoreError::FatalConfig(msg.to_string())
}

/// Saves a named-tensor dict (e.g. an `InferenceModel::state_dict`) to a
/// safetensors file.
pub fn save_named_tensors(tensors: &HashMap<String, Tensor>, path: impl AsRef<Path>) -> Result<()> {
    let mut raw: HashMap<String, (Vec<u8>, Dtype, Vec<usize>)> = HashMap::new();
    for (name, tensor) in tensors {
        let (data, dtype) = tensor_to_bytes(tensor, tensor.kind())?;
        let shape: Vec<usize> = tensor.size().iter().map(|&x| x as usize).collect();
        raw.insert(name.clone(), (data, dtype, shape));
    }

    let views: HashMap<String, TensorView<'_>> = raw
        .iter()
        .map(|(name, (data, dtype, shape))| {
            (
                name.clone(),
                TensorView::new(*dtype, shape.clone(), data).expect("valid tensor view"),
            )
        })
        .collect();

    serialize_to_file(views, &None, path.as_ref()).map_err(io_err)
}

/// Serializes a named-tensor dict to an in-memory safetensors blob, for
/// callers that ship the state dict over the wire (spec §4.G
/// `requestStateDict`) rather than to disk.
pub fn state_dict_to_bytes(tensors: &HashMap<String, Tensor>) -> Result<Vec<u8>> {
    let mut raw: HashMap<String, (Vec<u8>, Dtype, Vec<usize>)> = HashMap::new();
    for (name, tensor) in tensors {
        let (data, dtype) = tensor_to_bytes(tensor, tensor.kind())?;
        let shape: Vec<usize> = tensor.size().iter().map(|&x| x as usize).collect();
        raw.insert(name.clone(), (data, dtype, shape));
    }
    let views: HashMap<String, TensorView<'_>> = raw
        .iter()
        .map(|(name, (data, dtype, shape))| {
            (
                name.clone(),
                TensorView::new(*dtype, shape.clone(), data).expect("valid tensor view"),
            )
        })
        .collect();
    serialize(views, &None).map_err(io_err)
}

/// Inverse of [`state_dict_to_bytes`].
pub fn state_dict_from_bytes(bytes: &[u8]) -> Result<HashMap<String, Tensor>> {
    let parsed = SafeTensors::deserialize(bytes).map_err(io_err)?;
    let mut out = HashMap::new();
    for name in parsed.names() {
        let view = parsed.tensor(name).map_err(io_err)?;
        out.insert(name.clone(), tensor_view_to_tensor(&view)?);
    }
    Ok(out)
}

/// Loads a safetensors file into a named-tensor dict.
pub fn load_named_tensors(path: impl AsRef<Path>) -> Result<HashMap<String, Tensor>> {
    let mut file = File::open(path.as_ref())?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    let parsed = SafeTensors::deserialize(&buffer).map_err(io_err)?;

    let mut out = HashMap::new();
    for name in parsed.names() {
        let view = parsed.tensor(name).map_err(io_err)?;
        out.insert(name.clone(), tensor_view_to_tensor(&view)?);
    }
    Ok(out)
}

/// Saves a `tch::nn::VarStore` directly, for callers that keep their model
/// behind the `tch::nn` module API rather than a bare dict (the teacher's
/// original surface, kept for `tch`-idiomatic models).
pub fn save_varstore(vs: &nn::VarStore, path: impl AsRef<Path>) -> Result<()> {
    let dict: HashMap<String, Tensor> = vs.variables().into_iter().collect();
    save_named_tensors(&dict, path)
}

/// Loads a safetensors file into an existing `VarStore`'s variables in
/// place, warning about (but not failing on) any name absent from the
/// file.
pub fn load_varstore(vs: &mut nn::VarStore, path: impl AsRef<Path>) -> Result<()> {
    let mut file = File::open(path.as_ref())?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;
    let tensors = SafeTensors::deserialize(&buffer).map_err(io_err)?;

    for (name, mut var) in vs.variables() {
        match tensors.tensor(&name) {
            Ok(view) => {
                let loaded = tensor_view_to_tensor(&view)?;
                tch::no_grad(|| var.copy_(&loaded));
            }
            Err(_) => log::warn!("tensor '{name}' not present in safetensors file, leaving as-is"),
        }
    }
    Ok(())
}

fn tensor_to_bytes(tensor: &Tensor, kind: Kind) -> Result<(Vec<u8>, Dtype)> {
    let tensor = tensor.to_device(tch::Device::Cpu).flatten(0, -1).contiguous();
    match kind {
        Kind::Float => {
            let data: Vec<f32> = Vec::<f32>::try_from(&tensor).map_err(io_err)?;
            Ok((data.iter().flat_map(|x| x.to_le_bytes()).collect(), Dtype::F32))
        }
        Kind::Double => {
            let data: Vec<f64> = Vec::<f64>::try_from(&tensor).map_err(io_err)?;
            Ok((data.iter().flat_map(|x| x.to_le_bytes()).collect(), Dtype::F64))
        }
        Kind::Int => {
            let data: Vec<i32> = Vec::<i32>::try_from(&tensor).map_err(io_err)?;
            Ok((data.iter().flat_map(|x| x.to_le_bytes()).collect(), Dtype::I32))
        }
        Kind::Int64 => {
            let data: Vec<i64> = Vec::<i64>::try_from(&tensor).map_err(io_err)?;
            Ok((data.iter().flat_map(|x| x.to_le_bytes()).collect(), Dtype::I64))
        }
        Kind::Half | Kind::BFloat16 => {
            let data: Vec<f32> = Vec::<f32>::try_from(&tensor.to_kind(Kind::Float)).map_err(io_err)?;
            Ok((data.iter().flat_map(|x| x.to_le_bytes()).collect(), Dtype::F32))
        }
        other => Err(io_err(format!("unsupported tensor kind: {other:?}"))),
    }
}

fn tensor_view_to_tensor(view: &TensorView) -> Result<Tensor> {
    let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
    let data = view.data();
    let tensor = match view.dtype() {
        Dtype::F32 => Tensor::from_slice(
            &data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect::<Vec<f32>>(),
        ),
        Dtype::F64 => Tensor::from_slice(
            &data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                .collect::<Vec<f64>>(),
        ),
        Dtype::I32 => Tensor::from_slice(
            &data
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect::<Vec<i32>>(),
        ),
        Dtype::I64 => Tensor::from_slice(
            &data
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                .collect::<Vec<i64>>(),
        ),
        other => return Err(io_err(format!("unsupported dtype: {other:?}"))),
    };
    Ok(tensor.reshape(&shape))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_tensor_roundtrip_preserves_values() {
        let mut dict = HashMap::new();
        dict.insert(
            "w".to_string(),
            Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).reshape([2, 2]),
        );
        dict.insert("b".to_string(), Tensor::from_slice(&[0.5f32]));

        let path = std::env::temp_dir().join("alphazero_core_model_io_test.safetensors");
        save_named_tensors(&dict, &path).unwrap();
        let loaded = load_named_tensors(&path).unwrap();

        assert!(loaded["w"].allclose(&dict["w"], 1e-6, 1e-6, false));
        assert!(loaded["b"].allclose(&dict["b"], 1e-6, 1e-6, false));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn in_memory_state_dict_roundtrip_preserves_values() {
        let mut dict = HashMap::new();
        dict.insert("w".to_string(), Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).reshape([2, 2]));

        let bytes = state_dict_to_bytes(&dict).unwrap();
        let loaded = state_dict_from_bytes(&bytes).unwrap();
        assert!(loaded["w"].allclose(&dict["w"], 1e-6, 1e-6, false));
    }

    #[test]
    fn varstore_roundtrip_copies_in_place() {
        let vs1 = nn::VarStore::new(tch::Device::Cpu);
        let _l1 = nn::linear(vs1.root() / "l", 4, 2, Default::default());
        let path = std::env::temp_dir().join("alphazero_core_varstore_test.safetensors");
        save_varstore(&vs1, &path).unwrap();

        let mut vs2 = nn::VarStore::new(tch::Device::Cpu);
        let _l2 = nn::linear(vs2.root() / "l", 4, 2, Default::default());
        load_varstore(&mut vs2, &path).unwrap();

        for (name, t1) in vs1.variables() {
            let t2 = vs2
                .variables()
                .into_iter()
                .find(|(n, _)| n == &name)
                .unwrap()
                .1;
            assert!(t1.allclose(&t2, 1e-5, 1e-5, false));
        }
        std::fs::remove_file(&path).ok();
    }
}
