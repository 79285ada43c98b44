// ==========================================
// 价目表导入系统 - 定价规则引擎
// ==========================================
// 阶段 4: 已解析条目 → 定价条目 + 汇总
// 顺序: 规则按 order 稳定排序，逐条消费上一条的输出价格
// 规则: markup / discount（百分比或固定额）/ tierPricing（按起订量选档）
// 舍入: 仅在价格被修改时，四舍五入（远离零）到 max(2, 原精度)
// 红线: 不修改币种；空规则列表为严格的恒等变换
// ==========================================

use crate::domain::price_list::{
    Adjustment, PriceAudit, PriceRule, PriceRuleKind, PriceSummary, PricedItem, ResolvedItem,
    RuleApplication, RuleScope, ValidatedItem,
};
use crate::importer::error::{ImportError, ImportResult};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// 人工改价在审计记录中的规则名
pub const MANUAL_OVERRIDE_RULE: &str = "manual_override";

#[derive(Debug, Default)]
pub struct PriceRulesEngine;

impl PriceRulesEngine {
    pub fn new() -> Self {
        Self
    }

    /// 规则自检（在应用任何规则之前）
    pub fn validate_rules(&self, rules: &[PriceRule]) -> ImportResult<()> {
        for rule in rules {
            let invalid = |message: &str| ImportError::InvalidPriceRule {
                rule: rule.name.clone(),
                message: message.to_string(),
            };
            match &rule.kind {
                PriceRuleKind::Markup { adjustment } => {
                    check_adjustment(adjustment, rule.currency.as_deref(), false).map_err(invalid)?
                }
                PriceRuleKind::Discount { adjustment } => {
                    check_adjustment(adjustment, rule.currency.as_deref(), true).map_err(invalid)?
                }
                PriceRuleKind::TierPricing { tiers } => {
                    if tiers.is_empty() {
                        return Err(invalid("阶梯规则至少需要一个档位"));
                    }
                    for tier in tiers {
                        check_adjustment(&tier.adjustment, rule.currency.as_deref(), true)
                            .map_err(invalid)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// 按顺序应用规则
    pub fn apply(
        &self,
        items: &[ResolvedItem],
        rules: &[PriceRule],
    ) -> ImportResult<(Vec<PricedItem>, PriceSummary)> {
        self.validate_rules(rules)?;

        let mut ordered: Vec<&PriceRule> = rules.iter().collect();
        ordered.sort_by_key(|r| r.order);

        let mut priced = Vec::with_capacity(items.len());
        for resolved in items {
            priced.push(self.price_item(resolved, &ordered)?);
        }

        let summary = Self::summarize(&priced, &ordered)?;
        info!(
            items = summary.items_priced,
            rules = ordered.len(),
            total_before = %summary.total_before,
            total_after = %summary.total_after,
            "定价规则应用完成"
        );
        Ok((priced, summary))
    }

    fn price_item(&self, resolved: &ResolvedItem, rules: &[&PriceRule]) -> ImportResult<PricedItem> {
        let item = &resolved.item;
        let mut price = item.unit_price;
        let mut audit = Vec::new();

        for rule in rules {
            if !in_scope(&rule.scope, item) {
                continue;
            }
            if let Some(rule_currency) = &rule.currency {
                if !rule_currency.eq_ignore_ascii_case(&item.currency) {
                    return Err(ImportError::CurrencyMismatch {
                        rule: rule.name.clone(),
                        rule_currency: rule_currency.to_ascii_uppercase(),
                        item_currency: item.currency.clone(),
                    });
                }
            }

            let adjusted = match &rule.kind {
                PriceRuleKind::Markup { adjustment } => Some(markup(price, adjustment)),
                PriceRuleKind::Discount { adjustment } => Some(discount(price, adjustment)),
                PriceRuleKind::TierPricing { tiers } => {
                    let quantity = item.minimum_order_quantity.unwrap_or(1);
                    tiers
                        .iter()
                        .filter(|t| t.min_quantity <= quantity)
                        .max_by_key(|t| t.min_quantity)
                        .map(|tier| discount(price, &tier.adjustment))
                }
            };
            let Some(adjusted) = adjusted else {
                continue;
            };
            let adjusted = adjusted.ok_or_else(|| ImportError::PriceOverflow {
                sku: item.sku.clone(),
                rule: rule.name.clone(),
            })?;

            let scale = price.scale().max(2);
            let adjusted = adjusted.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
            if adjusted <= Decimal::ZERO {
                return Err(ImportError::NonPositivePrice {
                    sku: item.sku.clone(),
                    rule: rule.name.clone(),
                });
            }

            audit.push(PriceAudit {
                rule_name: rule.name.clone(),
                order: rule.order,
                price_before: price,
                price_after: adjusted,
                manual_override: false,
            });
            price = adjusted;
        }

        Ok(PricedItem {
            item: item.clone(),
            write_mode: resolved.write_mode.clone(),
            final_unit_price: price,
            applied_rules: audit,
        })
    }

    /// 审批时的人工改价（SKU → 最终单价）
    pub fn apply_overrides(
        &self,
        priced: &mut [PricedItem],
        overrides: &BTreeMap<String, Decimal>,
    ) -> ImportResult<usize> {
        for (sku, price) in overrides {
            let Some(target) = priced.iter_mut().find(|p| &p.item.sku == sku) else {
                return Err(ImportError::InvalidOptions(format!("改价的 SKU 不在本次导入中: {}", sku)));
            };
            if *price <= Decimal::ZERO {
                return Err(ImportError::NonPositivePrice {
                    sku: sku.clone(),
                    rule: MANUAL_OVERRIDE_RULE.to_string(),
                });
            }
            target.applied_rules.push(PriceAudit {
                rule_name: MANUAL_OVERRIDE_RULE.to_string(),
                order: i32::MAX,
                price_before: target.final_unit_price,
                price_after: *price,
                manual_override: true,
            });
            target.final_unit_price = *price;
            debug!(sku = %sku, price = %price, "人工改价已应用");
        }
        Ok(overrides.len())
    }

    pub fn summarize(priced: &[PricedItem], rules: &[&PriceRule]) -> ImportResult<PriceSummary> {
        let mut affected: BTreeMap<&str, usize> = BTreeMap::new();
        for item in priced {
            for audit in &item.applied_rules {
                *affected.entry(audit.rule_name.as_str()).or_default() += 1;
            }
        }
        let mut applications: Vec<RuleApplication> = rules
            .iter()
            .map(|rule| RuleApplication {
                rule_name: rule.name.clone(),
                affected_items: affected.get(rule.name.as_str()).copied().unwrap_or(0),
            })
            .collect();
        if let Some(count) = affected.get(MANUAL_OVERRIDE_RULE) {
            applications.push(RuleApplication {
                rule_name: MANUAL_OVERRIDE_RULE.to_string(),
                affected_items: *count,
            });
        }

        Ok(PriceSummary {
            items_priced: priced.len(),
            rules: applications,
            total_before: Self::checked_total(priced, |p| p.item.unit_price)?,
            total_after: Self::checked_total(priced, |p| p.final_unit_price)?,
        })
    }

    /// 金额合计（溢出 → PriceOverflow）
    pub fn checked_total(priced: &[PricedItem], price: impl Fn(&PricedItem) -> Decimal) -> ImportResult<Decimal> {
        priced.iter().try_fold(Decimal::ZERO, |total, item| {
            total.checked_add(price(item)).ok_or_else(|| ImportError::PriceOverflow {
                sku: item.item.sku.clone(),
                rule: "total".to_string(),
            })
        })
    }
}

fn check_adjustment(adjustment: &Adjustment, currency: Option<&str>, is_discount: bool) -> Result<(), &'static str> {
    match adjustment {
        Adjustment::Percentage(value) => {
            if value.is_sign_negative() {
                return Err("调整值不能为负");
            }
            if is_discount && *value > Decimal::ONE_HUNDRED {
                return Err("百分比折扣不能超过 100");
            }
        }
        Adjustment::Fixed(value) => {
            if value.is_sign_negative() {
                return Err("调整值不能为负");
            }
            if currency.is_none() {
                return Err("固定金额规则必须声明币种");
            }
        }
    }
    Ok(())
}

fn in_scope(scope: &RuleScope, item: &ValidatedItem) -> bool {
    match scope {
        RuleScope::All => true,
        RuleScope::Category(category) => item
            .category
            .as_deref()
            .map(|c| c.eq_ignore_ascii_case(category))
            .unwrap_or(false),
        RuleScope::Skus(skus) => skus.iter().any(|s| s == &item.sku),
    }
}

// 溢出 → None
fn markup(price: Decimal, adjustment: &Adjustment) -> Option<Decimal> {
    match adjustment {
        Adjustment::Percentage(p) => {
            let factor = Decimal::ONE.checked_add(p.checked_div(Decimal::ONE_HUNDRED)?)?;
            price.checked_mul(factor)
        }
        Adjustment::Fixed(v) => price.checked_add(*v),
    }
}

fn discount(price: Decimal, adjustment: &Adjustment) -> Option<Decimal> {
    match adjustment {
        Adjustment::Percentage(p) => {
            let factor = Decimal::ONE.checked_sub(p.checked_div(Decimal::ONE_HUNDRED)?)?;
            price.checked_mul(factor)
        }
        Adjustment::Fixed(v) => price.checked_sub(*v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::price_list::PriceTier;
    use crate::domain::types::WriteMode;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn resolved(sku: &str, price: &str, currency: &str) -> ResolvedItem {
        ResolvedItem {
            item: ValidatedItem {
                sku: sku.to_string(),
                description: String::new(),
                unit_price: dec(price),
                currency: currency.to_string(),
                minimum_order_quantity: None,
                unit_of_measure: None,
                category: None,
                row_number: 1,
                extra: BTreeMap::new(),
            },
            write_mode: WriteMode::Insert,
        }
    }

    #[test]
    fn test_empty_rules_is_identity() {
        let items = vec![resolved("A1", "12.5", "EUR"), resolved("A2", "0.333", "JPY")];
        let (priced, summary) = PriceRulesEngine::new().apply(&items, &[]).unwrap();
        for (p, r) in priced.iter().zip(&items) {
            assert_eq!(p.final_unit_price, r.item.unit_price);
            assert_eq!(p.final_unit_price.scale(), r.item.unit_price.scale());
            assert_eq!(p.item.currency, r.item.currency);
            assert!(p.applied_rules.is_empty());
        }
        assert_eq!(summary.total_before, summary.total_after);
    }

    #[test]
    fn test_markup_ten_percent() {
        let items = vec![resolved("SKU1", "12.50", "USD")];
        let rules = vec![PriceRule::markup_percent("markup", 1, dec("10"))];
        let (priced, summary) = PriceRulesEngine::new().apply(&items, &rules).unwrap();
        assert_eq!(priced[0].final_unit_price, dec("13.75"));
        assert_eq!(summary.rules[0].affected_items, 1);
    }

    #[test]
    fn test_markup_overflow_is_pricing_error() {
        let items = vec![resolved("BIG", "70000000000000000000000000000", "USD")];
        let rules = vec![PriceRule::markup_percent("markup", 1, dec("20"))];
        let err = PriceRulesEngine::new().apply(&items, &rules).unwrap_err();
        assert!(matches!(err, ImportError::PriceOverflow { ref sku, .. } if sku == "BIG"));
        assert_eq!(err.code(), "PricingError");
    }

    #[test]
    fn test_summary_total_overflow_is_pricing_error() {
        let items = vec![
            resolved("A1", "70000000000000000000000000000", "USD"),
            resolved("A2", "70000000000000000000000000000", "USD"),
        ];
        let err = PriceRulesEngine::new().apply(&items, &[]).unwrap_err();
        assert!(matches!(err, ImportError::PriceOverflow { ref sku, .. } if sku == "A2"));
    }

    #[test]
    fn test_rules_applied_in_order() {
        let items = vec![resolved("A1", "100", "USD")];
        // 先折扣 10% 再加价 10%: 100 → 90 → 99
        let rules = vec![
            PriceRule::markup_percent("markup", 2, dec("10")),
            PriceRule::discount_percent("discount", 1, dec("10")),
        ];
        let (priced, _) = PriceRulesEngine::new().apply(&items, &rules).unwrap();
        assert_eq!(priced[0].final_unit_price, dec("99"));
        assert_eq!(priced[0].applied_rules[0].rule_name, "discount");
        assert_eq!(priced[0].applied_rules[0].price_after, dec("90"));
    }

    #[test]
    fn test_tier_pricing_by_moq() {
        let mut item = resolved("A1", "10.00", "USD");
        item.item.minimum_order_quantity = Some(150);
        let rule = PriceRule {
            name: "tiers".to_string(),
            order: 1,
            scope: RuleScope::All,
            currency: None,
            kind: PriceRuleKind::TierPricing {
                tiers: vec![
                    PriceTier { min_quantity: 10, adjustment: Adjustment::Percentage(dec("5")) },
                    PriceTier { min_quantity: 100, adjustment: Adjustment::Percentage(dec("10")) },
                    PriceTier { min_quantity: 500, adjustment: Adjustment::Percentage(dec("20")) },
                ],
            },
        };
        let untiered = resolved("A2", "10.00", "USD");
        let (priced, summary) = PriceRulesEngine::new().apply(&[item, untiered], &[rule]).unwrap();
        assert_eq!(priced[0].final_unit_price, dec("9.00"));
        assert_eq!(priced[1].final_unit_price, dec("10.00"));
        assert_eq!(summary.rules[0].affected_items, 1);
    }

    #[test]
    fn test_scope_and_currency_mismatch() {
        let mut widget = resolved("A1", "10", "EUR");
        widget.item.category = Some("Tools".to_string());
        let other = resolved("A2", "10", "USD");

        let rule = PriceRule::markup_percent("tools", 1, dec("20"))
            .with_scope(RuleScope::Category("tools".to_string()))
            .with_currency("EUR");
        let (priced, _) = PriceRulesEngine::new()
            .apply(&[widget.clone(), other.clone()], &[rule])
            .unwrap();
        assert_eq!(priced[0].final_unit_price, dec("12.00"));
        assert_eq!(priced[1].final_unit_price, dec("10"));

        let all_usd = PriceRule::markup_percent("usd", 1, dec("20")).with_currency("USD");
        let err = PriceRulesEngine::new().apply(&[widget], &[all_usd]).unwrap_err();
        assert!(matches!(err, ImportError::CurrencyMismatch { .. }));
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let engine = PriceRulesEngine::new();
        let too_much = PriceRule::discount_percent("d", 1, dec("120"));
        assert!(matches!(engine.validate_rules(&[too_much]), Err(ImportError::InvalidPriceRule { .. })));

        let fixed_without_currency = PriceRule {
            name: "fixed".to_string(),
            order: 1,
            scope: RuleScope::All,
            currency: None,
            kind: PriceRuleKind::Markup { adjustment: Adjustment::Fixed(dec("1")) },
        };
        assert!(engine.validate_rules(&[fixed_without_currency]).is_err());

        let empty_tiers = PriceRule {
            name: "t".to_string(),
            order: 1,
            scope: RuleScope::All,
            currency: None,
            kind: PriceRuleKind::TierPricing { tiers: vec![] },
        };
        assert!(engine.validate_rules(&[empty_tiers]).is_err());
    }

    #[test]
    fn test_non_positive_result() {
        let rule = PriceRule {
            name: "fixed".to_string(),
            order: 1,
            scope: RuleScope::All,
            currency: Some("USD".to_string()),
            kind: PriceRuleKind::Discount { adjustment: Adjustment::Fixed(dec("5")) },
        };
        let err = PriceRulesEngine::new()
            .apply(&[resolved("A1", "5", "USD")], &[rule])
            .unwrap_err();
        assert_eq!(err.code(), "PricingError");
    }

    #[test]
    fn test_rounding_half_away_from_zero() {
        // 1.005 * 1.5 = 1.5075 → 精度 3 → 1.508
        let rule = PriceRule::markup_percent("m", 1, dec("50"));
        let (priced, _) = PriceRulesEngine::new()
            .apply(&[resolved("A1", "1.005", "USD")], &[rule])
            .unwrap();
        assert_eq!(priced[0].final_unit_price, dec("1.508"));
    }

    #[test]
    fn test_manual_override_audited() {
        let engine = PriceRulesEngine::new();
        let (mut priced, _) = engine.apply(&[resolved("A1", "10", "USD")], &[]).unwrap();
        let overrides = BTreeMap::from([("A1".to_string(), dec("8.50"))]);
        engine.apply_overrides(&mut priced, &overrides).unwrap();
        assert_eq!(priced[0].final_unit_price, dec("8.50"));
        assert!(priced[0].applied_rules[0].manual_override);

        let unknown = BTreeMap::from([("ZZ".to_string(), dec("1"))]);
        assert!(engine.apply_overrides(&mut priced, &unknown).is_err());
    }
}
