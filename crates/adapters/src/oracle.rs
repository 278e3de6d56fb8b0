// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Oracle Gateway (§4.I): synchronous JSON request/reply to an external
//! LLM process, for cron parsing and task-complexity analysis. Results are
//! cached by normalized input; callers that want the fallback heuristic on
//! unavailability implement it themselves (§4.F step 1).

use afk_core::{Clock, ScheduleType, SystemClock};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const CRON_TIMEOUT: Duration = Duration::from_secs(120);
pub const COMPLEXITY_TIMEOUT: Duration = Duration::from_secs(30);
const CACHE_TTL_MS: u64 = 5 * 60 * 1000;
const CACHE_MAX_ENTRIES: usize = 100;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),
    #[error("oracle returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CronPlan {
    pub cron: String,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    pub explanation: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComplexityPlan {
    pub complexity: ComplexityField,
    pub model: String,
    pub iterations: u32,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityField {
    Simple,
    Moderate,
    Complex,
}

impl From<ComplexityField> for Complexity {
    fn from(value: ComplexityField) -> Self {
        match value {
            ComplexityField::Simple => Complexity::Simple,
            ComplexityField::Moderate => Complexity::Moderate,
            ComplexityField::Complex => Complexity::Complex,
        }
    }
}

/// Synchronous gateway to an external oracle process.
#[async_trait]
pub trait OracleClient: Send + Sync + 'static {
    async fn parse_cron(&self, input: &str, reference_time_iso: &str) -> Result<CronPlan, OracleError>;
    async fn analyze_complexity(&self, task: &str) -> Result<ComplexityPlan, OracleError>;
    async fn is_available(&self) -> bool;
}

/// Extracts the first balanced `{...}` JSON object from a reply that may
/// contain surrounding prose, per §4.I's "response parsing is defensive".
fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn normalize(input: &str) -> String {
    input.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Invokes a configured subprocess, writing a JSON request line to stdin and
/// reading a JSON reply from stdout, within a timeout.
pub struct SubprocessOracleClient {
    program: String,
    args: Vec<String>,
}

impl SubprocessOracleClient {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    /// Bounded retry with progressive delay around a single call (§4.I).
    /// A malformed reply (`InvalidResponse`) is not retried, since a
    /// second call to the same program on the same input won't parse any
    /// differently; process-level failures (`Unavailable`, `Timeout`) are.
    async fn call(&self, request: serde_json::Value, timeout: Duration) -> Result<serde_json::Value, OracleError> {
        let max_attempts = crate::env::oracle_max_attempts();
        let base = crate::env::oracle_retry_base_ms();
        let mut last_err = OracleError::Unavailable("oracle never invoked".into());

        for attempt in 0..max_attempts {
            match self.call_once(&request, timeout).await {
                Ok(value) => return Ok(value),
                Err(err @ OracleError::InvalidResponse(_)) => return Err(err),
                Err(err) => {
                    last_err = err;
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(base * 2u32.pow(attempt as u32)).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn call_once(&self, request: &serde_json::Value, timeout: Duration) -> Result<serde_json::Value, OracleError> {
        let fut = async {
            let mut child = Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| OracleError::Unavailable(e.to_string()))?;

            let mut stdin = child.stdin.take().ok_or_else(|| OracleError::Unavailable("no stdin".into()))?;
            let payload = serde_json::to_vec(request).map_err(|e| OracleError::InvalidResponse(e.to_string()))?;
            stdin.write_all(&payload).await.map_err(|e| OracleError::Unavailable(e.to_string()))?;
            drop(stdin);

            let output = child.wait_with_output().await.map_err(|e| OracleError::Unavailable(e.to_string()))?;
            if !output.status.success() {
                return Err(OracleError::Unavailable(format!("oracle process exited with {}", output.status)));
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            let json_text = extract_first_json_object(&stdout)
                .ok_or_else(|| OracleError::InvalidResponse("no JSON object in reply".into()))?;
            serde_json::from_str(json_text).map_err(|e| OracleError::InvalidResponse(e.to_string()))
        };

        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout(timeout)),
        }
    }
}

#[async_trait]
impl OracleClient for SubprocessOracleClient {
    async fn parse_cron(&self, input: &str, reference_time_iso: &str) -> Result<CronPlan, OracleError> {
        let request = serde_json::json!({ "mode": "cron", "input": input, "reference_time": reference_time_iso });
        let value = self.call(request, CRON_TIMEOUT).await?;
        serde_json::from_value(value).map_err(|e| OracleError::InvalidResponse(e.to_string()))
    }

    async fn analyze_complexity(&self, task: &str) -> Result<ComplexityPlan, OracleError> {
        let request = serde_json::json!({ "mode": "complexity", "task": task });
        let value = self.call(request, COMPLEXITY_TIMEOUT).await?;
        serde_json::from_value(value).map_err(|e| OracleError::InvalidResponse(e.to_string()))
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.program).arg("--version").stdout(Stdio::null()).stderr(Stdio::null()).status().await.is_ok()
    }
}

enum CacheEntry {
    Cron(CronPlan),
    Complexity(ComplexityPlan),
}

impl Clone for CacheEntry {
    fn clone(&self) -> Self {
        match self {
            CacheEntry::Cron(p) => CacheEntry::Cron(p.clone()),
            CacheEntry::Complexity(p) => CacheEntry::Complexity(p.clone()),
        }
    }
}

/// Decorates any `OracleClient` with a normalized-input cache (§4.I):
/// 5-minute TTL, evicted once the cache exceeds 100 entries.
pub struct CachingOracleClient<T, C = SystemClock> {
    inner: T,
    clock: C,
    cache: Mutex<HashMap<String, (u64, CacheEntry)>>,
}

impl<T: OracleClient, C: Clock> CachingOracleClient<T, C> {
    pub fn new(inner: T, clock: C) -> Self {
        Self { inner, clock, cache: Mutex::new(HashMap::new()) }
    }

    fn get_fresh(&self, key: &str) -> Option<CacheEntry> {
        let cache = self.cache.lock();
        let (cached_at, entry) = cache.get(key)?;
        if self.clock.now_ms().saturating_sub(*cached_at) < CACHE_TTL_MS {
            Some(entry.clone())
        } else {
            None
        }
    }

    fn put(&self, key: String, entry: CacheEntry) {
        let mut cache = self.cache.lock();
        if cache.len() >= CACHE_MAX_ENTRIES {
            // Evict an arbitrary entry (size-bounded, not LRU) to make room.
            if let Some(evict_key) = cache.keys().next().cloned() {
                cache.remove(&evict_key);
            }
        }
        cache.insert(key, (self.clock.now_ms(), entry));
    }
}

#[async_trait]
impl<T: OracleClient, C: Clock> OracleClient for CachingOracleClient<T, C> {
    async fn parse_cron(&self, input: &str, reference_time_iso: &str) -> Result<CronPlan, OracleError> {
        let key = format!("cron:{}:{reference_time_iso}", normalize(input));
        if let Some(CacheEntry::Cron(plan)) = self.get_fresh(&key) {
            return Ok(plan);
        }
        let plan = self.inner.parse_cron(input, reference_time_iso).await?;
        self.put(key, CacheEntry::Cron(plan.clone()));
        Ok(plan)
    }

    async fn analyze_complexity(&self, task: &str) -> Result<ComplexityPlan, OracleError> {
        let key = format!("complexity:{}", normalize(task));
        if let Some(CacheEntry::Complexity(plan)) = self.get_fresh(&key) {
            return Ok(plan);
        }
        let plan = self.inner.analyze_complexity(task).await?;
        self.put(key, CacheEntry::Complexity(plan.clone()));
        Ok(plan)
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::Mutex as PMutex;

    /// Scripted oracle for hermetic engine tests.
    #[derive(Default)]
    pub struct FakeOracleClient {
        available: std::sync::atomic::AtomicBool,
        cron_replies: PMutex<Vec<Result<CronPlan, OracleError>>>,
        complexity_replies: PMutex<Vec<Result<ComplexityPlan, OracleError>>>,
        cron_calls: PMutex<Vec<String>>,
        complexity_calls: PMutex<Vec<String>>,
    }

    impl FakeOracleClient {
        pub fn new() -> Self {
            Self { available: std::sync::atomic::AtomicBool::new(true), ..Default::default() }
        }

        pub fn set_available(&self, available: bool) {
            self.available.store(available, std::sync::atomic::Ordering::SeqCst);
        }

        pub fn push_cron_reply(&self, reply: Result<CronPlan, OracleError>) {
            self.cron_replies.lock().push(reply);
        }

        pub fn push_complexity_reply(&self, reply: Result<ComplexityPlan, OracleError>) {
            self.complexity_replies.lock().push(reply);
        }

        pub fn complexity_calls(&self) -> Vec<String> {
            self.complexity_calls.lock().clone()
        }
    }

    #[async_trait]
    impl OracleClient for FakeOracleClient {
        async fn parse_cron(&self, input: &str, _reference_time_iso: &str) -> Result<CronPlan, OracleError> {
            self.cron_calls.lock().push(input.to_string());
            let mut replies = self.cron_replies.lock();
            if replies.is_empty() {
                Err(OracleError::Unavailable("no scripted reply".into()))
            } else {
                replies.remove(0)
            }
        }

        async fn analyze_complexity(&self, task: &str) -> Result<ComplexityPlan, OracleError> {
            self.complexity_calls.lock().push(task.to_string());
            let mut replies = self.complexity_replies.lock();
            if replies.is_empty() {
                Err(OracleError::Unavailable("no scripted reply".into()))
            } else {
                replies.remove(0)
            }
        }

        async fn is_available(&self) -> bool {
            self.available.load(std::sync::atomic::Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
#[path = "oracle_tests.rs"]
mod tests;
