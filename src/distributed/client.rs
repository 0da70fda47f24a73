//! The distributed service's client side (spec §4.G), grounded on
//! `original_source/torchRL/tube/src_cpp/distributed.h`'s
//! `DistributedClient`: periodic `requestModel` polling, state-dict pull on
//! version change, and buffered result flushing.

use std::collections::HashSet;
use std::sync::Mutex;

use prost::Message;

use crate::distributed::messages::{
    GameResultArgs, GameResultEntry, ModelRatio, RequestModelArgs, RequestModelReply,
    RequestStateDictArgs, RequestStateDictReply, TrainDataArgs,
};
use crate::error::Result;
use crate::rpc::RpcClient;

const DEV_MODEL_ID: &str = "dev";
/// After this many games against the current opponent with `is_tournament_opponent`
/// results counted in (ratio >= 0.9), the client asks for a fresh opponent id
/// on its next poll (original: `gamesDoneWithCurrentModel >= 64`).
const GAMES_BEFORE_REROLL: u32 = 64;

struct State {
    known_model_ids: HashSet<String>,
    current_model_id: String,
    current_model_version: i32,
    games_done_with_current_model: u32,
    wants_new_model_id: bool,
    result_queue: Vec<(f32, Vec<(String, f32)>)>,
}

/// A client to one distributed service endpoint. Call [`Self::poll`]
/// periodically from a self-play actor loop; it reconciles the opponent id
/// and version, pulling a fresh state dict only when the version changes
/// (spec §4.G "onUpdateModel callback").
pub struct DistributedClient {
    rpc: RpcClient,
    state: Mutex<State>,
}

impl DistributedClient {
    pub fn connect(endpoint: impl Into<String>) -> Self {
        let mut known = HashSet::new();
        known.insert(DEV_MODEL_ID.to_string());
        Self {
            rpc: RpcClient::connect(endpoint),
            state: Mutex::new(State {
                known_model_ids: known,
                current_model_id: DEV_MODEL_ID.to_string(),
                current_model_version: -1,
                games_done_with_current_model: 0,
                wants_new_model_id: false,
                result_queue: Vec::new(),
            }),
        }
    }

    pub fn current_model_id(&self) -> String {
        self.state.lock().unwrap().current_model_id.clone()
    }

    /// Queues a completed game's reward and per-model mixing ratios for the
    /// next poll's `gameResult` flush; flags a reroll once `is_tournament_opponent`
    /// games against the current model pass [`GAMES_BEFORE_REROLL`] (original:
    /// `sendResult`).
    pub fn queue_result(&self, reward: f32, ratios: Vec<(String, f32)>) {
        let mut state = self.state.lock().unwrap();
        if let Some((_, ratio)) = ratios.iter().find(|(id, _)| *id == state.current_model_id) {
            if *ratio >= 0.9 {
                state.games_done_with_current_model += 1;
                if state.games_done_with_current_model >= GAMES_BEFORE_REROLL {
                    state.wants_new_model_id = true;
                }
            }
        }
        state.result_queue.push((reward, ratios));
    }

    /// Flushes any queued results and resolves the current opponent id and
    /// version, pulling a fresh state dict when the version has advanced.
    /// Returns the freshly pulled state dict bytes, or `None` if the
    /// version was already current (original: `requestModel`).
    pub async fn poll(&self, is_tournament_opponent: bool) -> Result<Option<(String, Vec<u8>)>> {
        let (queued, wants_new, model_id) = {
            let mut state = self.state.lock().unwrap();
            let queued = std::mem::take(&mut state.result_queue);
            let wants_new = if is_tournament_opponent { std::mem::take(&mut state.wants_new_model_id) } else { false };
            (queued, wants_new, state.current_model_id.clone())
        };

        if !queued.is_empty() {
            let args = GameResultArgs {
                results: queued
                    .into_iter()
                    .map(|(reward, ratios)| GameResultEntry {
                        reward,
                        ratios: ratios.into_iter().map(|(model_id, ratio)| ModelRatio { model_id, ratio }).collect(),
                    })
                    .collect(),
            };
            self.rpc.call("gameResult", args.encode_to_vec()).await?;
        }

        let args = RequestModelArgs { wants_new_model_id: wants_new, model_id };
        let reply_bytes = self.rpc.call("requestModel", args.encode_to_vec()).await?;
        let reply = RequestModelReply::decode(reply_bytes.as_slice())
            .map_err(|e| crate::error::CoreError::Remote(format!("bad requestModel reply: {e}")))?;

        let version_changed = {
            let mut state = self.state.lock().unwrap();
            if state.current_model_id != reply.model_id {
                state.known_model_ids.insert(reply.model_id.clone());
                state.current_model_id = reply.model_id.clone();
                state.current_model_version = -1;
                state.games_done_with_current_model = 0;
            }
            let changed = reply.version != state.current_model_version;
            if changed {
                state.current_model_version = reply.version;
            }
            changed
        };

        if !version_changed {
            return Ok(None);
        }

        let dict_args = RequestStateDictArgs { model_id: reply.model_id.clone() };
        let dict_reply_bytes = self.rpc.call("requestStateDict", dict_args.encode_to_vec()).await?;
        let dict_reply = RequestStateDictReply::decode(dict_reply_bytes.as_slice())
            .map_err(|e| crate::error::CoreError::Remote(format!("bad requestStateDict reply: {e}")))?;

        if !dict_reply.found {
            let mut state = self.state.lock().unwrap();
            state.current_model_id = DEV_MODEL_ID.to_string();
            state.current_model_version = -1;
            return Ok(None);
        }

        Ok(Some((reply.model_id, dict_reply.state_dict)))
    }

    pub async fn send_train_data(&self, payload: Vec<u8>) -> Result<()> {
        let args = TrainDataArgs { payload };
        self.rpc.call("trainData", args.encode_to_vec()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::registry::ModelRegistry;
    use crate::distributed::server;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn poll_pulls_state_dict_on_version_change() {
        let registry = Arc::new(ModelRegistry::new(3));
        registry.update_model(DEV_MODEL_ID, vec![7, 7, 7]);
        let (train_tx, _train_rx) = mpsc::channel(8);

        let listener = crate::rpc::transport::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let registry_for_server = registry.clone();
        tokio::spawn(async move {
            server::serve(&addr.to_string(), registry_for_server, train_tx).await.ok();
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let client = DistributedClient::connect(addr.to_string());
        let pulled = client.poll(false).await.unwrap();
        assert_eq!(pulled, Some((DEV_MODEL_ID.to_string(), vec![7, 7, 7])));

        // Second poll at the same version should not re-pull.
        let pulled_again = client.poll(false).await.unwrap();
        assert_eq!(pulled_again, None);
    }

    #[tokio::test]
    async fn queue_result_flags_reroll_after_threshold_wins() {
        let client = DistributedClient::connect("127.0.0.1:1");
        for _ in 0..GAMES_BEFORE_REROLL {
            client.queue_result(1.0, vec![(DEV_MODEL_ID.to_string(), 1.0)]);
        }
        assert!(client.state.lock().unwrap().wants_new_model_id);
    }
}
