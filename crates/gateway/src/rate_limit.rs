use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-tenant sliding-window request limiter. A limit of zero disables it.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    limit: u32,
    max_tenants: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, limit: u32, max_tenants: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            limit,
            max_tenants,
        }
    }

    pub fn enabled(&self) -> bool {
        self.limit > 0
    }

    pub fn allow(&self, tenant_id: &str) -> bool {
        if !self.enabled() {
            return true;
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let queue = inner.entry(tenant_id.to_string()).or_default();
        prune_queue(queue, now, self.window);
        if queue.len() >= self.limit as usize {
            return false;
        }
        queue.push_back(now);

        if inner.len() > self.max_tenants {
            inner.retain(|_, events| {
                prune_queue(events, now, self.window);
                !events.is_empty()
            });
        }

        if inner.len() > self.max_tenants {
            let mut overflow = inner.len() - self.max_tenants;
            let keys = inner
                .keys()
                .filter(|k| k.as_str() != tenant_id)
                .cloned()
                .collect::<Vec<_>>();
            for key in keys {
                if overflow == 0 {
                    break;
                }
                if inner.remove(&key).is_some() {
                    overflow -= 1;
                }
            }
        }

        true
    }
}

fn prune_queue(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = queue.front() {
        if now.duration_since(*front) > window {
            queue.pop_front();
        } else {
            break;
        }
    }
}
