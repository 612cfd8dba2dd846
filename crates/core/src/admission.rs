//! Cluster admission control.

use crate::request::Request;
use blis_config::{AdmissionKind, SimulationConfig};
use blis_types::{Ticks, TICKS_PER_SEC};

/// Rules on every arrival before routing. Rejection is terminal.
pub trait AdmissionPolicy {
    fn name(&self) -> &'static str;
    fn admit(&mut self, request: &Request, now: Ticks) -> bool;
}

pub struct AlwaysAdmit;

impl AdmissionPolicy for AlwaysAdmit {
    fn name(&self) -> &'static str {
        "always"
    }

    fn admit(&mut self, _request: &Request, _now: Ticks) -> bool {
        true
    }
}

/// Testing aid: turns everything away.
pub struct RejectAll;

impl AdmissionPolicy for RejectAll {
    fn name(&self) -> &'static str {
        "reject-all"
    }

    fn admit(&mut self, _request: &Request, _now: Ticks) -> bool {
        false
    }
}

/// Token bucket over input tokens: a request consumes its input-token count
/// and is rejected when the bucket cannot cover it.
pub struct TokenBucket {
    capacity: f64,
    /// Tokens per tick.
    refill_rate: f64,
    tokens: f64,
    last_refill: Ticks,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_rate: refill_per_sec / TICKS_PER_SEC as f64,
            tokens: capacity,
            last_refill: 0,
        }
    }

    fn refill(&mut self, now: Ticks) {
        let elapsed = now.saturating_sub(self.last_refill);
        self.tokens = (self.tokens + elapsed as f64 * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

impl AdmissionPolicy for TokenBucket {
    fn name(&self) -> &'static str {
        "token-bucket"
    }

    fn admit(&mut self, request: &Request, now: Ticks) -> bool {
        self.refill(now);
        let cost = request.input_tokens as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

pub fn build_admission_policy(config: &SimulationConfig) -> Box<dyn AdmissionPolicy> {
    match config.admission {
        AdmissionKind::Always => Box::new(AlwaysAdmit),
        AdmissionKind::RejectAll => Box::new(RejectAll),
        AdmissionKind::TokenBucket => Box::new(TokenBucket::new(
            config.token_bucket_capacity,
            config.token_bucket_refill_rate,
        )),
    }
}
