//! The rating-sampled model registry (spec §4.G), grounded verbatim on
//! `original_source/torchRL/tube/src_cpp/distributed.h`'s `DistributedServer`:
//! `sampleModelId`, `rollChance`, and `addResult` are ported constant-for-
//! constant (K=6, scale=400, offset in {0, 0.5, 1}, target
//! `-(2/(exp(4x)-1))·200`), per SPEC_FULL §4.G.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DEV_MODEL_ID: &str = "dev";
const LEADERBOARD_INTERVAL: Duration = Duration::from_secs(120);

/// Everything the registry tracks about one model: rating, the games it's
/// faced, and its latest state dict (a safetensors-serialized blob handed
/// out verbatim to clients that pull it).
#[derive(Clone, Debug)]
pub struct ModelInfo {
    pub id: String,
    pub version: i32,
    pub rating: f32,
    pub state_dict: Vec<u8>,
    pub ngames: u64,
    pub reward_sum: f64,
    pub avg_reward: f32,
    prev_ngames: u64,
    prev_reward_sum: f64,
    cur_games: u64,
    cur_reward: f32,
}

impl ModelInfo {
    fn new(id: String) -> Self {
        Self {
            id,
            version: 0,
            rating: 0.0,
            state_dict: Vec::new(),
            ngames: 0,
            reward_sum: 0.0,
            avg_reward: 0.0,
            prev_ngames: 0,
            prev_reward_sum: 0.0,
            cur_games: 0,
            cur_reward: 0.0,
        }
    }
}

struct Inner {
    models: HashMap<String, ModelInfo>,
    rng: StdRng,
    last_rating_print: Instant,
}

/// A model registry keyed by opaque model id (spec §4.G "model registry").
/// Every method locks the same inner mutex, matching the original's
/// single `std::mutex mut` guarding the whole table.
pub struct ModelRegistry {
    inner: Mutex<Inner>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ModelRegistry {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                models: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
                last_rating_print: Instant::now(),
            }),
        }
    }

    /// Registers (or replaces) `id`'s state dict and bumps its version. A
    /// newly created model inherits `dev`'s current rating (original:
    /// `updateModel`).
    pub fn update_model(&self, id: &str, state_dict: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        let dev_rating = inner.models.get(DEV_MODEL_ID).map(|m| m.rating);
        let entry = inner.models.entry(id.to_string()).or_insert_with(|| {
            let mut info = ModelInfo::new(id.to_string());
            if let Some(rating) = dev_rating {
                info.rating = rating;
            }
            info
        });
        entry.state_dict = state_dict;
        entry.version += 1;
    }

    /// `requestModel`: resolves an opponent id (sampled if
    /// `wants_new_model_id`, else the caller's current id) to its current
    /// version, falling back to `dev` if the id is unknown.
    pub fn request_model(&self, wants_new_model_id: bool, model_id: &str) -> (String, i32) {
        let mut inner = self.inner.lock().unwrap();
        let resolved = if wants_new_model_id { Self::sample_model_id(&mut inner) } else { model_id.to_string() };
        let (final_id, version) = match inner.models.get(&resolved) {
            Some(m) => (resolved, m.version),
            None => match inner.models.get(DEV_MODEL_ID) {
                Some(m) => (DEV_MODEL_ID.to_string(), m.version),
                None => (DEV_MODEL_ID.to_string(), -1),
            },
        };
        (final_id, version)
    }

    pub fn request_state_dict(&self, model_id: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.models.get(model_id).map(|m| m.state_dict.clone())
    }

    /// `gameResult`: applies an Elo-style rating update per (reward, ratio)
    /// entry via [`Self::add_result`].
    pub fn game_result(&self, results: &[(f32, Vec<(String, f32)>)]) {
        for (reward, ratios) in results {
            for (id, ratio) in ratios {
                self.add_result(id, *ratio, *reward);
            }
        }
    }

    /// Elo-style update between `id` and `dev` (original: `addResult`).
    /// Skipped when `ratio < 0.9` (too few of the game's moves came from
    /// this model's policy to trust the result) or when `id` is unknown or
    /// is `dev` itself.
    pub fn add_result(&self, id: &str, ratio: f32, reward: f32) {
        if ratio < 0.9 {
            return;
        }
        if id == DEV_MODEL_ID {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.models.contains_key(id) || !inner.models.contains_key(DEV_MODEL_ID) {
            return;
        }

        let rating = inner.models[id].rating;
        let dev_rating = inner.models[DEV_MODEL_ID].rating;

        let calc = |reward: f32, diff: f32| -> f32 {
            let k = 6.0f32;
            let scale = 400.0f32;
            let offset = if reward > 0.0 {
                1.0
            } else if reward < 0.0 {
                0.0
            } else {
                0.5
            };
            k * (offset - 1.0 / (1.0 + 10f32.powf(diff / scale)))
        };

        let delta = calc(reward, dev_rating - rating) * ratio;
        let delta_dev = calc(-reward, rating - dev_rating) * ratio;

        {
            let m = inner.models.get_mut(id).unwrap();
            m.rating += delta;
            m.ngames += 1;
            m.reward_sum += reward as f64;
            m.avg_reward = (m.reward_sum / m.ngames as f64) as f32;
        }
        {
            let dev = inner.models.get_mut(DEV_MODEL_ID).unwrap();
            dev.rating += delta_dev;
            dev.ngames += 1;
            dev.reward_sum -= reward as f64;
            dev.avg_reward = (dev.reward_sum / dev.ngames as f64) as f32;
        }

        self.maybe_log_leaderboard(&mut inner);
    }

    fn maybe_log_leaderboard(&self, inner: &mut Inner) {
        let now = Instant::now();
        if now.duration_since(inner.last_rating_print) < LEADERBOARD_INTERVAL {
            return;
        }
        inner.last_rating_print = now;

        let mut sorted: Vec<(f32, String)> = Vec::with_capacity(inner.models.len());
        for (id, m) in inner.models.iter_mut() {
            m.cur_games = m.ngames - m.prev_ngames;
            m.cur_reward = if m.cur_games > 0 {
                ((m.reward_sum - m.prev_reward_sum) / m.cur_games as f64) as f32
            } else {
                0.0
            };
            m.prev_ngames = m.ngames;
            m.prev_reward_sum = m.reward_sum;
            sorted.push((m.rating, id.clone()));
        }
        sorted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());

        let top: Vec<&(f32, String)> = sorted.iter().take(20).collect();
        let mut report = String::from("Top 20:\n");
        for (rank, (rating, id)) in top.iter().enumerate() {
            let m = &inner.models[id];
            let chance = Self::roll_chance_locked(&inner, id);
            report.push_str(&format!(
                "{}. {:.3} {} (roll {:.3}) (total {} games, {:.3} avg reward) (diff {} games, {:.3} avg reward)\n",
                rank + 1,
                rating,
                id,
                chance,
                m.ngames,
                m.avg_reward,
                m.cur_games,
                m.cur_reward
            ));
        }
        log::info!("{report}");
    }

    /// `rollChance`: the fraction of the opponent-sampling distribution
    /// mass assigned to `id`, used only for leaderboard reporting.
    fn roll_chance_locked(inner: &Inner, id: &str) -> f32 {
        let Some(target) = inner.models.get(id) else { return 0.0 };
        let rating = target.rating;
        let max = inner.models.values().map(|m| m.rating).fold(f32::MIN, f32::max);

        let mut sorted: Vec<(f32, &str)> =
            inner.models.iter().map(|(id, m)| (m.rating, id.as_str())).collect();
        sorted.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());

        let mut lo = 1.0f32;
        let mut ret = 0.0f32;
        for (i, &(r, _)) in sorted.iter().enumerate() {
            let x = r - max;
            let o = if x == 0.0 { 1.0 } else { ((1.0 - (2.0 * 200.0) / x).ln() / 4.0).min(1.0) };
            if r < rating {
                ret += (lo - o) / (i as f32).max(1.0);
            }
            lo = o;
        }
        ret += lo / sorted.len() as f32;
        ret
    }

    /// `sampleModelId`: 50% `dev`, 1% uniform-random model, else a model
    /// drawn from the rating band `[max + target, max]` where `target`
    /// widens as `x` (uniform in `[0,1)`) grows.
    fn sample_model_id(inner: &mut Inner) -> String {
        if inner.models.is_empty() || inner.rng.random_bool(0.5) {
            return DEV_MODEL_ID.to_string();
        }
        if inner.rng.random_bool(0.01) {
            let idx = inner.rng.random_range(0..inner.models.len());
            return inner.models.keys().nth(idx).unwrap().clone();
        }

        let max = inner.models.values().map(|m| m.rating).fold(f32::MIN, f32::max);
        let x: f64 = inner.rng.random_range(0.0..1.0);
        let target = -(2.0 / ((x * 4.0).exp() - 1.0)) * 200.0;

        let pool: Vec<&String> = inner
            .models
            .iter()
            .filter(|(_, m)| (m.rating - max) as f64 >= target)
            .map(|(id, _)| id)
            .collect();

        if pool.is_empty() {
            DEV_MODEL_ID.to_string()
        } else {
            let idx = inner.rng.random_range(0..pool.len());
            pool[idx].clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_falls_back_to_dev() {
        let registry = ModelRegistry::new(1);
        registry.update_model(DEV_MODEL_ID, vec![1, 2, 3]);
        let (id, version) = registry.request_model(false, "nonexistent");
        assert_eq!(id, DEV_MODEL_ID);
        assert_eq!(version, 1);
    }

    #[test]
    fn new_model_inherits_dev_rating() {
        let registry = ModelRegistry::new(1);
        registry.update_model(DEV_MODEL_ID, vec![]);
        registry.add_result(DEV_MODEL_ID, 1.0, 0.0); // no-op: dev vs dev skipped
        {
            let mut inner = registry.inner.lock().unwrap();
            inner.models.get_mut(DEV_MODEL_ID).unwrap().rating = 42.0;
        }
        registry.update_model("candidate", vec![9]);
        let state = registry.request_state_dict("candidate").unwrap();
        assert_eq!(state, vec![9]);
        assert_eq!(registry.inner.lock().unwrap().models["candidate"].rating, 42.0);
    }

    #[test]
    fn low_ratio_results_are_ignored() {
        let registry = ModelRegistry::new(1);
        registry.update_model(DEV_MODEL_ID, vec![]);
        registry.update_model("candidate", vec![]);
        registry.add_result("candidate", 0.5, 1.0);
        assert_eq!(registry.inner.lock().unwrap().models["candidate"].ngames, 0);
    }

    #[test]
    fn winning_candidate_gains_rating_against_dev() {
        let registry = ModelRegistry::new(1);
        registry.update_model(DEV_MODEL_ID, vec![]);
        registry.update_model("candidate", vec![]);
        for _ in 0..20 {
            registry.add_result("candidate", 1.0, 1.0);
        }
        let (candidate_rating, dev_rating) = {
            let inner = registry.inner.lock().unwrap();
            (inner.models["candidate"].rating, inner.models[DEV_MODEL_ID].rating)
        };
        assert!(candidate_rating > dev_rating, "a consistently winning model should outrate dev");
    }

    #[test]
    fn sample_model_id_returns_dev_when_registry_is_empty() {
        let registry = ModelRegistry::new(1);
        let mut inner = registry.inner.lock().unwrap();
        assert_eq!(ModelRegistry::sample_model_id(&mut inner), DEV_MODEL_ID);
    }
}
