//! Category resolution: an ordered chain of strategies, cheapest first.
//!
//! The manager runs strategies one at a time per transaction and stops at
//! the first result that names a category with at least `min_confidence`.
//! Different transactions may be resolved concurrently.

pub mod ai;
pub mod categories;
pub mod history;
pub mod rule;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use tracing::debug;

use crate::completion::CompletionChain;
use crate::db::Database;
use crate::error::Result;
use crate::models::{CategorizationResult, Category, NormalizedTransaction, OwnerProfile};
use crate::settings::CategorizationSettings;

#[derive(Debug, Clone)]
pub struct CategorizationInput {
    pub merchant_name: String,
    pub description: String,
    pub amount: Decimal,
    pub date: Option<NaiveDate>,
}

impl From<&NormalizedTransaction> for CategorizationInput {
    fn from(txn: &NormalizedTransaction) -> Self {
        Self {
            merchant_name: txn.merchant_name.clone(),
            description: txn.description.clone(),
            amount: txn.amount,
            date: Some(txn.transaction_date),
        }
    }
}

/// Owner-scoped data shared by every transaction of one run.
#[derive(Debug, Clone, Default)]
pub struct CategorizationContext {
    pub owner_id: String,
    /// Candidate list for the AI strategy.
    pub available_categories: Vec<Category>,
    pub profile: OwnerProfile,
}

impl CategorizationContext {
    pub async fn load(db: &Database, owner_id: &str) -> Result<Self> {
        let available_categories = categories::available_categories(db, owner_id, None).await?;
        let profile = categories::get_profile(db, owner_id).await?;
        Ok(Self {
            owner_id: owner_id.to_string(),
            available_categories,
            profile,
        })
    }
}

#[async_trait]
pub trait CategorizationStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Lower runs first.
    fn priority(&self) -> u32;
    async fn categorize(
        &self,
        input: &CategorizationInput,
        ctx: &CategorizationContext,
    ) -> Result<CategorizationResult>;
}

pub struct CategoryManager {
    strategies: Vec<Arc<dyn CategorizationStrategy>>,
    min_confidence: f64,
}

impl CategoryManager {
    pub fn new(min_confidence: f64) -> Self {
        Self {
            strategies: Vec::new(),
            min_confidence,
        }
    }

    /// Rule and history strategies, plus AI when enabled and a provider exists.
    pub fn standard(
        db: Database,
        chain: CompletionChain,
        settings: &CategorizationSettings,
        ai_enabled: bool,
    ) -> Self {
        let mut manager = Self::new(settings.min_confidence);
        manager.add_strategy(Arc::new(rule::RuleStrategy::new(db.clone())));
        manager.add_strategy(Arc::new(history::HistoryStrategy::new(
            db,
            settings.history_confidence,
        )));
        if ai_enabled && !chain.is_empty() {
            manager.add_strategy(Arc::new(ai::AiStrategy::new(chain)));
        }
        manager
    }

    pub fn add_strategy(&mut self, strategy: Arc<dyn CategorizationStrategy>) {
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| s.priority());
    }

    pub fn remove_strategy(&mut self, name: &str) -> bool {
        let before = self.strategies.len();
        self.strategies.retain(|s| s.name() != name);
        self.strategies.sort_by_key(|s| s.priority());
        self.strategies.len() != before
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn categorize(
        &self,
        input: &CategorizationInput,
        ctx: &CategorizationContext,
    ) -> Result<CategorizationResult> {
        let mut suggestion = None;
        for strategy in &self.strategies {
            let result = strategy.categorize(input, ctx).await?;
            if result.category_id.is_some() && result.confidence >= self.min_confidence {
                debug!(
                    strategy = strategy.name(),
                    merchant = %input.merchant_name,
                    confidence = result.confidence,
                    "Categorized"
                );
                return Ok(result);
            }
            if result.category_id.is_some() {
                debug!(
                    strategy = strategy.name(),
                    confidence = result.confidence,
                    min_confidence = self.min_confidence,
                    "Result below threshold, trying next strategy"
                );
            }
            if result.suggested_category.is_some() {
                suggestion = result.suggested_category;
            }
        }
        Ok(CategorizationResult {
            suggested_category: suggestion,
            ..CategorizationResult::none()
        })
    }

    /// Resolve many transactions, at most `concurrency` at a time, keeping
    /// input order.
    pub async fn categorize_many(
        &self,
        inputs: &[CategorizationInput],
        ctx: &CategorizationContext,
        concurrency: usize,
    ) -> Result<Vec<CategorizationResult>> {
        stream::iter(inputs.iter().map(|input| self.categorize(input, ctx)))
            .buffered(concurrency.max(1))
            .boxed()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::models::CategorizationMethod;

    /// Strategy returning a fixed result and counting its calls.
    pub struct FixedStrategy {
        pub name: &'static str,
        pub priority: u32,
        pub result: CategorizationResult,
        pub calls: AtomicUsize,
    }

    impl FixedStrategy {
        pub fn new(name: &'static str, priority: u32, category: Option<&str>, confidence: f64) -> Self {
            Self {
                name,
                priority,
                result: CategorizationResult {
                    category_id: category.map(str::to_string),
                    category_name: category.map(str::to_string),
                    confidence,
                    method: CategorizationMethod::Rule,
                    ..CategorizationResult::none()
                },
                calls: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CategorizationStrategy for FixedStrategy {
        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        async fn categorize(
            &self,
            _input: &CategorizationInput,
            _ctx: &CategorizationContext,
        ) -> Result<CategorizationResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    pub fn input(merchant: &str) -> CategorizationInput {
        CategorizationInput {
            merchant_name: merchant.to_string(),
            description: merchant.to_string(),
            amount: Decimal::new(-1000, 2),
            date: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::models::CategorizationMethod;

    #[tokio::test]
    async fn test_first_confident_result_stops_chain() {
        let first = Arc::new(FixedStrategy::new("rule", 1, Some("cat-a"), 1.0));
        let second = Arc::new(FixedStrategy::new("history", 2, Some("cat-b"), 0.85));
        let third = Arc::new(FixedStrategy::new("ai", 100, Some("cat-c"), 0.9));
        let mut manager = CategoryManager::new(0.7);
        manager.add_strategy(third.clone());
        manager.add_strategy(second.clone());
        manager.add_strategy(first.clone());
        assert_eq!(manager.strategy_names(), vec!["rule", "history", "ai"]);

        let result = manager
            .categorize(&input("ADOBE"), &CategorizationContext::default())
            .await
            .unwrap();
        assert_eq!(result.category_id.as_deref(), Some("cat-a"));
        assert_eq!(first.call_count(), 1);
        assert_eq!(second.call_count(), 0);
        assert_eq!(third.call_count(), 0);
    }

    #[tokio::test]
    async fn test_below_threshold_falls_through() {
        let weak = Arc::new(FixedStrategy::new("history", 2, Some("cat-b"), 0.5));
        let strong = Arc::new(FixedStrategy::new("ai", 100, Some("cat-c"), 0.9));
        let mut manager = CategoryManager::new(0.7);
        manager.add_strategy(weak.clone());
        manager.add_strategy(strong.clone());
        let result = manager
            .categorize(&input("X"), &CategorizationContext::default())
            .await
            .unwrap();
        assert_eq!(result.category_id.as_deref(), Some("cat-c"));
        assert_eq!(weak.call_count(), 1);
    }

    #[tokio::test]
    async fn test_nothing_matches_gives_none() {
        let empty = Arc::new(FixedStrategy::new("rule", 1, None, 0.0));
        let mut manager = CategoryManager::new(0.7);
        manager.add_strategy(empty);
        let result = manager
            .categorize(&input("X"), &CategorizationContext::default())
            .await
            .unwrap();
        assert_eq!(result.category_id, None);
        assert_eq!(result.method, CategorizationMethod::None);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_remove_strategy_resorts() {
        let mut manager = CategoryManager::new(0.7);
        manager.add_strategy(Arc::new(FixedStrategy::new("ai", 100, None, 0.0)));
        manager.add_strategy(Arc::new(FixedStrategy::new("rule", 1, None, 0.0)));
        assert!(manager.remove_strategy("rule"));
        assert!(!manager.remove_strategy("rule"));
        assert_eq!(manager.strategy_names(), vec!["ai"]);
    }

    #[tokio::test]
    async fn test_categorize_many_keeps_order() {
        let mut manager = CategoryManager::new(0.7);
        manager.add_strategy(Arc::new(FixedStrategy::new("rule", 1, Some("cat-a"), 1.0)));
        let inputs: Vec<_> = (0..5).map(|i| input(&format!("M{i}"))).collect();
        let results = manager
            .categorize_many(&inputs, &CategorizationContext::default(), 2)
            .await
            .unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.category_id.as_deref() == Some("cat-a")));
    }
}
