use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sliding-window limiter for token minting, keyed by principal. A limit of
/// zero disables limiting. Bounded key count so a scan of principal ids
/// cannot grow the map without bound.
#[derive(Clone)]
pub struct MintRateLimiter {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    limit: u32,
    max_keys: usize,
}

impl MintRateLimiter {
    pub fn new(window: Duration, limit: u32, max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            limit,
            max_keys,
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        if self.limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let events = inner.entry(key.to_string()).or_default();
        drop_expired(events, now, self.window);
        if events.len() >= self.limit as usize {
            return false;
        }
        events.push_back(now);

        if inner.len() > self.max_keys {
            inner.retain(|_, events| {
                drop_expired(events, now, self.window);
                !events.is_empty()
            });

            let mut overflow = inner.len().saturating_sub(self.max_keys);
            if overflow > 0 {
                let keys = inner.keys().cloned().collect::<Vec<_>>();
                for key in keys {
                    if overflow == 0 {
                        break;
                    }
                    if inner.remove(&key).is_some() {
                        overflow -= 1;
                    }
                }
            }
        }

        true
    }
}

fn drop_expired(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = events.front() {
        if now.duration_since(*front) > window {
            events.pop_front();
        } else {
            break;
        }
    }
}
