/*
 * Copyright (C) 2026 The Milpa Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::milpa::logger::log_warn;

/// Backoff settings for calls that can fail transiently (KV store, cloud
/// API, node agent). `max_attempts == 0` retries forever.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Runs `operation` until it succeeds or the attempt budget is spent.
/// Each delay is jittered to 50-150% of the nominal backoff.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    return Err(error);
                }
                let sleep_for = jittered(delay);
                log_warn(
                    "retry",
                    "operation failed, backing off",
                    &[
                        ("operation", operation_name),
                        ("attempt", &attempt.to_string()),
                        ("delayMs", &sleep_for.as_millis().to_string()),
                        ("error", &error.to_string()),
                    ],
                );
                tokio::time::sleep(sleep_for).await;
                delay = next_delay(delay, config);
            }
        }
    }
}

pub fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

fn next_delay(current: Duration, config: &RetryConfig) -> Duration {
    let scaled = Duration::from_secs_f64(current.as_secs_f64() * config.multiplier);
    scaled.min(config.max_delay)
}
