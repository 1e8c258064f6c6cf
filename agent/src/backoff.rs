/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::time::{Duration, Instant};

use rand::Rng;

/// Jittered exponential backoff for tunnel redials. `next_backoff` returns
/// None once the elapsed budget is spent; the caller decides whether that
/// is fatal or the start of a fresh cycle.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(15 * 60),
            jitter: 0.5,
        }
    }
}

#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    started: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.interval;
        ExponentialBackoff {
            config,
            current,
            started: None,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.config.interval;
        self.started = None;
    }

    pub fn next_backoff(&mut self) -> Option<Duration> {
        let started = *self.started.get_or_insert_with(Instant::now);
        if started.elapsed() > self.config.max_elapsed {
            return None;
        }

        let base = self.current;
        let next = base.mul_f64(self.config.multiplier);
        self.current = next.min(self.config.max_interval);

        let jittered = if self.config.jitter > 0.0 {
            let factor = rand::thread_rng()
                .gen_range(1.0 - self.config.jitter..=1.0 + self.config.jitter);
            base.mul_f64(factor)
        } else {
            base
        };
        Some(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_caps_at_max_interval() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_millis(400),
            max_elapsed: Duration::from_secs(60),
            jitter: 0.0,
        });

        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(400)));
    }

    #[test]
    fn exhausts_after_max_elapsed() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            max_elapsed: Duration::from_millis(1),
            ..Default::default()
        });
        // the first call starts the clock
        assert!(backoff.next_backoff().is_some());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(backoff.next_backoff(), None);
    }

    #[test]
    fn reset_restarts_the_cycle() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(60),
            jitter: 0.0,
        });
        let _ = backoff.next_backoff();
        let _ = backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
    }
}
