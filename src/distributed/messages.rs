//! Wire messages for the distributed service's four RPCs (spec §4.G),
//! encoded with `prost`'s derive macro rather than build-time `.proto`
//! codegen -- the teacher's serialization crate, used the way a hand-written
//! message type uses it when no schema compiler is wired into the build.

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct RequestModelArgs {
    #[prost(bool, tag = "1")]
    pub wants_new_model_id: bool,
    #[prost(string, tag = "2")]
    pub model_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct RequestModelReply {
    #[prost(string, tag = "1")]
    pub model_id: String,
    #[prost(int32, tag = "2")]
    pub version: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct RequestStateDictArgs {
    #[prost(string, tag = "1")]
    pub model_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct RequestStateDictReply {
    #[prost(bool, tag = "1")]
    pub found: bool,
    /// Safetensors-serialized blob of the model's full state dict.
    #[prost(bytes, tag = "2")]
    pub state_dict: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TrainDataArgs {
    #[prost(bytes, tag = "1")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ModelRatio {
    #[prost(string, tag = "1")]
    pub model_id: String,
    #[prost(float, tag = "2")]
    pub ratio: f32,
}

#[derive(Clone, PartialEq, Message)]
pub struct GameResultEntry {
    #[prost(float, tag = "1")]
    pub reward: f32,
    #[prost(message, repeated, tag = "2")]
    pub ratios: Vec<ModelRatio>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GameResultArgs {
    #[prost(message, repeated, tag = "1")]
    pub results: Vec<GameResultEntry>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UpdateModelArgs {
    #[prost(string, tag = "1")]
    pub model_id: String,
    #[prost(bytes, tag = "2")]
    pub state_dict: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_model_args_round_trip_through_prost_bytes() {
        let args = RequestModelArgs { wants_new_model_id: true, model_id: "dev".to_string() };
        let bytes = args.encode_to_vec();
        let decoded = RequestModelArgs::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, args);
    }

    #[test]
    fn game_result_args_round_trip_with_nested_messages() {
        let args = GameResultArgs {
            results: vec![GameResultEntry {
                reward: 1.0,
                ratios: vec![ModelRatio { model_id: "dev".to_string(), ratio: 0.95 }],
            }],
        };
        let bytes = args.encode_to_vec();
        let decoded = GameResultArgs::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, args);
    }
}
