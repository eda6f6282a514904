use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::{CategorizationContext, CategorizationInput, CategorizationStrategy};
use crate::completion::{CompletionChain, CompletionRequest};
use crate::error::Result;
use crate::models::{CategorizationMethod, CategorizationResult, Category, CategoryScope, TransactionType};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiAnswer {
    category_name: String,
    confidence: f64,
    #[serde(default)]
    is_new_category: bool,
    #[serde(default)]
    business_name: Option<String>,
}

const SYSTEM_PROMPT: &str = "You categorize personal and business financial transactions. \
Choose the single best category from the provided list. Only if none fits, propose a short new \
category name and set isNewCategory to true. Report your confidence between 0 and 1.";

fn answer_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["categoryName", "confidence", "isNewCategory"],
        "properties": {
            "categoryName": {"type": "string", "minLength": 1},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "isNewCategory": {"type": "boolean"},
            "businessName": {"type": ["string", "null"]}
        }
    })
}

/// Completion-backed fallback. Never fails: any completion error degrades to
/// an empty result.
pub struct AiStrategy {
    chain: CompletionChain,
}

impl AiStrategy {
    pub fn new(chain: CompletionChain) -> Self {
        Self { chain }
    }
}

/// Candidates matching the transaction direction; all of them when the
/// direction leaves nothing to pick from.
fn candidates<'a>(input: &CategorizationInput, all: &'a [Category]) -> Vec<&'a Category> {
    let wanted = if input.amount.is_sign_negative() {
        TransactionType::Expense
    } else {
        TransactionType::Income
    };
    let filtered: Vec<&Category> = all.iter().filter(|c| c.category_type == wanted).collect();
    if filtered.is_empty() {
        all.iter().collect()
    } else {
        filtered
    }
}

pub fn build_prompt(input: &CategorizationInput, candidates: &[&Category], ctx: &CategorizationContext) -> String {
    let mut prompt = format!(
        "Transaction:\n- Merchant: {}\n- Description: {}\n- Amount: {}\n",
        input.merchant_name, input.description, input.amount
    );
    if let Some(date) = input.date {
        prompt.push_str(&format!("- Date: {date}\n"));
    }
    prompt.push_str("\nAvailable categories:\n");
    for category in candidates {
        prompt.push_str(&format!("- {}\n", category.name));
    }
    let profile = &ctx.profile;
    let mut preferences = Vec::new();
    if let Some(country) = &profile.country {
        preferences.push(format!("Country: {country}"));
    }
    if let Some(usage) = profile.usage_type {
        let usage = match usage {
            CategoryScope::Personal => "personal finances",
            CategoryScope::Business => "business bookkeeping",
            CategoryScope::Both => "personal and business finances",
        };
        preferences.push(format!("Used for: {usage}"));
    }
    if !profile.businesses.is_empty() {
        let names: Vec<&str> = profile.businesses.iter().map(|b| b.name.as_str()).collect();
        preferences.push(format!(
            "Businesses: {} (set businessName when the expense belongs to one)",
            names.join(", ")
        ));
    }
    if !preferences.is_empty() {
        prompt.push_str("\nOwner preferences:\n");
        for p in preferences {
            prompt.push_str(&format!("- {p}\n"));
        }
    }
    prompt
}

#[async_trait]
impl CategorizationStrategy for AiStrategy {
    fn name(&self) -> &'static str {
        "ai"
    }

    fn priority(&self) -> u32 {
        100
    }

    async fn categorize(
        &self,
        input: &CategorizationInput,
        ctx: &CategorizationContext,
    ) -> Result<CategorizationResult> {
        if ctx.available_categories.is_empty() {
            return Ok(CategorizationResult::none());
        }
        let candidates = candidates(input, &ctx.available_categories);
        let request = CompletionRequest {
            purpose: "categorization",
            system: SYSTEM_PROMPT.to_string(),
            prompt: build_prompt(input, &candidates, ctx),
            schema: answer_schema(),
            attachment: None,
            max_output_tokens: 300,
        };
        let answer = match self.chain.complete::<AiAnswer>(&request).await {
            Ok(completion) => completion.data,
            Err(e) => {
                warn!(merchant = %input.merchant_name, error = %e, "AI categorization unavailable");
                return Ok(CategorizationResult::none());
            }
        };

        let name = answer.category_name.trim().to_string();
        let business_id = answer.business_name.as_deref().and_then(|wanted| {
            ctx.profile
                .businesses
                .iter()
                .find(|b| b.name.eq_ignore_ascii_case(wanted.trim()))
                .map(|b| b.id.clone())
        });
        let matched = if answer.is_new_category {
            None
        } else {
            candidates
                .iter()
                .find(|c| c.name.to_lowercase() == name.to_lowercase())
        };
        Ok(match matched {
            Some(category) => CategorizationResult {
                category_id: Some(category.id.clone()),
                category_name: Some(category.name.clone()),
                business_id,
                confidence: answer.confidence.clamp(0.0, 1.0),
                method: CategorizationMethod::Ai,
                matched_rule_id: None,
                suggested_category: None,
            },
            None => CategorizationResult {
                business_id,
                confidence: answer.confidence.clamp(0.0, 1.0),
                method: CategorizationMethod::Ai,
                suggested_category: Some(name),
                ..CategorizationResult::none()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use super::*;
    use crate::categorize::testing::input;
    use crate::completion::testing::{chain_of, FakeProvider};
    use crate::error::SpendsortError;
    use crate::models::{Business, OwnerProfile};

    fn category(id: &str, name: &str, category_type: TransactionType) -> Category {
        Category {
            id: id.into(),
            owner_id: None,
            name: name.into(),
            scope: CategoryScope::Both,
            category_type,
        }
    }

    fn ctx() -> CategorizationContext {
        CategorizationContext {
            owner_id: "owner-1".into(),
            available_categories: vec![
                category("c-dining", "Dining", TransactionType::Expense),
                category("c-fuel", "Fuel", TransactionType::Expense),
                category("c-salary", "Salary", TransactionType::Income),
            ],
            profile: OwnerProfile {
                country: Some("US".into()),
                usage_type: Some(CategoryScope::Both),
                businesses: vec![Business {
                    id: "b-1".into(),
                    name: "Acme Studio".into(),
                }],
            },
        }
    }

    #[tokio::test]
    async fn test_resolves_name_case_insensitively() {
        let provider = Arc::new(FakeProvider::new(
            "fake",
            vec![Ok(json!({
                "categoryName": "dining",
                "confidence": 0.82,
                "isNewCategory": false,
                "businessName": "acme studio"
            }))],
        ));
        let strategy = AiStrategy::new(chain_of(vec![provider.clone()]));
        let result = strategy.categorize(&input("BLUE BOTTLE"), &ctx()).await.unwrap();
        assert_eq!(result.category_id.as_deref(), Some("c-dining"));
        assert_eq!(result.business_id.as_deref(), Some("b-1"));
        assert_eq!(result.method, CategorizationMethod::Ai);

        let prompt = provider.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("- Fuel"));
        assert!(!prompt.contains("- Salary"));
        assert!(prompt.contains("Country: US"));
        assert!(prompt.contains("Acme Studio"));
    }

    #[tokio::test]
    async fn test_new_category_is_only_a_suggestion() {
        let provider = Arc::new(FakeProvider::new(
            "fake",
            vec![Ok(json!({"categoryName": "Pet Care", "confidence": 0.9, "isNewCategory": true}))],
        ));
        let strategy = AiStrategy::new(chain_of(vec![provider]));
        let result = strategy.categorize(&input("PETCO"), &ctx()).await.unwrap();
        assert_eq!(result.category_id, None);
        assert_eq!(result.suggested_category.as_deref(), Some("Pet Care"));
    }

    #[tokio::test]
    async fn test_completion_failure_degrades_to_none() {
        let provider = Arc::new(FakeProvider::new(
            "fake",
            vec![Err(SpendsortError::Completion {
                provider: "fake".into(),
                message: "timeout".into(),
            })],
        ));
        let strategy = AiStrategy::new(chain_of(vec![provider]));
        let result = strategy.categorize(&input("X"), &ctx()).await.unwrap();
        assert_eq!(result, CategorizationResult::none());
    }

    #[tokio::test]
    async fn test_skipped_without_candidates() {
        let provider = Arc::new(FakeProvider::new("fake", vec![]));
        let strategy = AiStrategy::new(chain_of(vec![provider.clone()]));
        let empty = CategorizationContext {
            owner_id: "owner-1".into(),
            ..Default::default()
        };
        let result = strategy.categorize(&input("X"), &empty).await.unwrap();
        assert_eq!(result.method, CategorizationMethod::None);
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_income_candidates_for_positive_amounts() {
        let ctx = ctx();
        let mut payroll = input("ACME PAYROLL");
        payroll.amount = Decimal::new(250000, 2);
        let picked = candidates(&payroll, &ctx.available_categories);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].name, "Salary");
    }
}
