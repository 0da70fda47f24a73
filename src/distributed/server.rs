//! The distributed service's RPC-exposed surface (spec §4.G), grounded on
//! `original_source/torchRL/tube/src_cpp/distributed.h`'s `DistributedServer`:
//! `requestModel`, `requestStateDict`, `trainData`, and `gameResult` wired
//! onto [`crate::rpc::RpcServer`].

use std::sync::Arc;

use prost::Message;
use tokio::sync::mpsc;

use crate::distributed::messages::{
    GameResultArgs, RequestModelArgs, RequestModelReply, RequestStateDictArgs, RequestStateDictReply,
    TrainDataArgs,
};
use crate::distributed::registry::ModelRegistry;
use crate::error::{CoreError, Result};
use crate::rpc::RpcServer;

/// Runs the distributed service's accept loop at `endpoint`, registering
/// the four RPCs against `registry`. Incoming `trainData` payloads are
/// forwarded onto `train_data_tx` for a training loop to consume
/// (`original_source`'s `onTrainData` callback, generalized to a channel).
pub async fn serve(
    endpoint: &str,
    registry: Arc<ModelRegistry>,
    train_data_tx: mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    let mut server = RpcServer::new();

    {
        let registry = registry.clone();
        server.register("requestModel", move |args| {
            let args = RequestModelArgs::decode(args.as_slice())
                .map_err(|e| CoreError::Remote(format!("bad requestModel args: {e}")))?;
            let (model_id, version) = registry.request_model(args.wants_new_model_id, &args.model_id);
            Ok(RequestModelReply { model_id, version }.encode_to_vec())
        });
    }

    {
        let registry = registry.clone();
        server.register("requestStateDict", move |args| {
            let args = RequestStateDictArgs::decode(args.as_slice())
                .map_err(|e| CoreError::Remote(format!("bad requestStateDict args: {e}")))?;
            let reply = match registry.request_state_dict(&args.model_id) {
                Some(state_dict) => RequestStateDictReply { found: true, state_dict },
                None => RequestStateDictReply { found: false, state_dict: Vec::new() },
            };
            Ok(reply.encode_to_vec())
        });
    }

    server.register("trainData", move |args| {
        let args = TrainDataArgs::decode(args.as_slice())
            .map_err(|e| CoreError::Remote(format!("bad trainData args: {e}")))?;
        train_data_tx
            .try_send(args.payload)
            .map_err(|e| CoreError::TransientNetwork(format!("train data channel full or closed: {e}")))?;
        Ok(Vec::new())
    });

    server.register("gameResult", move |args| {
        let args = GameResultArgs::decode(args.as_slice())
            .map_err(|e| CoreError::Remote(format!("bad gameResult args: {e}")))?;
        let results: Vec<(f32, Vec<(String, f32)>)> = args
            .results
            .into_iter()
            .map(|entry| {
                let ratios = entry.ratios.into_iter().map(|r| (r.model_id, r.ratio)).collect();
                (entry.reward, ratios)
            })
            .collect();
        registry.game_result(&results);
        Ok(Vec::new())
    });

    server.serve(endpoint).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::messages::{ModelRatio, RequestModelArgs};
    use crate::rpc::RpcClient;

    #[tokio::test]
    async fn request_model_round_trips_over_rpc() {
        let registry = Arc::new(ModelRegistry::new(1));
        registry.update_model("dev", vec![1, 2, 3]);
        let (tx, _rx) = mpsc::channel(8);

        let mut server = RpcServer::new();
        {
            let registry = registry.clone();
            server.register("requestModel", move |args| {
                let args = RequestModelArgs::decode(args.as_slice()).unwrap();
                let (model_id, version) = registry.request_model(args.wants_new_model_id, &args.model_id);
                Ok(RequestModelReply { model_id, version }.encode_to_vec())
            });
        }
        drop(tx);
        let addr = server.spawn_on("127.0.0.1:0").await.unwrap();

        let client = RpcClient::connect(addr.to_string());
        let args = RequestModelArgs { wants_new_model_id: false, model_id: "dev".to_string() };
        let reply_bytes = client.call("requestModel", args.encode_to_vec()).await.unwrap();
        let reply = RequestModelReply::decode(reply_bytes.as_slice()).unwrap();
        assert_eq!(reply.model_id, "dev");
        assert_eq!(reply.version, 1);
    }

    #[tokio::test]
    async fn game_result_updates_registry_ratings() {
        let registry = Arc::new(ModelRegistry::new(2));
        registry.update_model("dev", vec![]);
        registry.update_model("candidate", vec![]);
        let (tx, _rx) = mpsc::channel(8);

        let mut server = RpcServer::new();
        {
            let registry = registry.clone();
            server.register("gameResult", move |args| {
                let args = GameResultArgs::decode(args.as_slice()).unwrap();
                let results: Vec<(f32, Vec<(String, f32)>)> = args
                    .results
                    .into_iter()
                    .map(|e| (e.reward, e.ratios.into_iter().map(|r| (r.model_id, r.ratio)).collect()))
                    .collect();
                registry.game_result(&results);
                Ok(Vec::new())
            });
        }
        drop(tx);
        let addr = server.spawn_on("127.0.0.1:0").await.unwrap();

        let client = RpcClient::connect(addr.to_string());
        let args = GameResultArgs {
            results: vec![crate::distributed::messages::GameResultEntry {
                reward: 1.0,
                ratios: vec![ModelRatio { model_id: "candidate".to_string(), ratio: 1.0 }],
            }],
        };
        client.call("gameResult", args.encode_to_vec()).await.unwrap();

        assert!(registry.request_model(false, "candidate").1 >= 0);
    }
}
