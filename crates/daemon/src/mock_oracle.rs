// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A deterministic stand-in for the Oracle Gateway, selected by the
//! `AFK_MOCK_ORACLE` environment input (§6) so integration tests and
//! demos don't need a real oracle binary on `PATH`.

use afk_adapters::oracle::ComplexityField;
use afk_adapters::{ComplexityPlan, CronPlan, OracleClient, OracleError};
use afk_core::ScheduleType;
use async_trait::async_trait;

/// Always reports zero confidence, so [`afk_engine::IterationEngine::plan`]
/// falls back to its own keyword heuristic rather than trusting a
/// fabricated iteration count. `parse_cron` recognizes a handful of
/// literal phrases and otherwise defaults to "every minute", which is
/// deterministic but not meant to be useful beyond smoke-testing the
/// Schedule Engine's wiring.
#[derive(Debug, Default)]
pub struct MockOracleClient;

#[async_trait]
impl OracleClient for MockOracleClient {
    async fn parse_cron(&self, input: &str, _reference_time_iso: &str) -> Result<CronPlan, OracleError> {
        let lower = input.to_lowercase();
        let cron = if lower.contains("hourly") {
            "0 * * * *"
        } else if lower.contains("daily") || lower.contains("every day") {
            "0 9 * * *"
        } else if lower.contains("weekday") {
            "0 9 * * 1-5"
        } else {
            "* * * * *"
        };
        Ok(CronPlan { cron: cron.to_string(), schedule_type: ScheduleType::Recurring, explanation: "mock oracle: literal phrase match".to_string() })
    }

    async fn analyze_complexity(&self, task: &str) -> Result<ComplexityPlan, OracleError> {
        Ok(ComplexityPlan {
            complexity: ComplexityField::Moderate,
            model: "mock".to_string(),
            iterations: task.split_whitespace().count().max(1) as u32,
            confidence: 0.0,
            reasoning: "mock oracle: deferring to heuristic fallback".to_string(),
        })
    }

    async fn is_available(&self) -> bool {
        true
    }
}
