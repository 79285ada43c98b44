// ==========================================
// 价目表导入系统 - 重复记录处理器
// ==========================================
// 阶段 3: 校验通过的条目 vs 供应商现有目录快照
// 策略: skip / overwrite / merge → 直接得到最终条目
//       warn → 返回重复列表，等待人工决定
// 确定性: 输出按行号排序；快照中同 SKU 多条时取 item_id 最小者
// ==========================================

use crate::domain::price_list::{
    CatalogItem, DuplicateRecord, DuplicateResolution, ResolvedItem, ValidatedItem,
};
use crate::domain::types::{DuplicateAction, DuplicateHandling, WriteMode};
use crate::importer::error::{ImportError, ImportResult};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub struct DuplicateResolver;

impl DuplicateResolver {
    /// 按策略解析重复
    pub fn resolve(
        &self,
        items: &[ValidatedItem],
        existing: &[CatalogItem],
        policy: DuplicateHandling,
    ) -> DuplicateResolution {
        let snapshot = Self::index_snapshot(existing);

        let mut ordered: Vec<&ValidatedItem> = items.iter().collect();
        ordered.sort_by(|a, b| a.row_number.cmp(&b.row_number).then_with(|| a.sku.cmp(&b.sku)));

        let action = match policy {
            DuplicateHandling::Skip => DuplicateAction::Skip,
            DuplicateHandling::Overwrite => DuplicateAction::Overwrite,
            DuplicateHandling::Merge => DuplicateAction::Merge,
            DuplicateHandling::Warn => DuplicateAction::Pending,
        };

        let mut new_items = Vec::new();
        let mut duplicates = Vec::new();
        for item in ordered {
            match snapshot.get(item.sku.as_str()) {
                Some(existing_item) => duplicates.push(DuplicateRecord {
                    sku: item.sku.clone(),
                    existing_item: (*existing_item).clone(),
                    new_item: item.clone(),
                    resolution_action: action,
                }),
                None => new_items.push(ResolvedItem {
                    item: item.clone(),
                    write_mode: WriteMode::Insert,
                }),
            }
        }

        debug!(
            policy = %policy,
            new_items = new_items.len(),
            duplicates = duplicates.len(),
            "重复检查完成"
        );

        if policy == DuplicateHandling::Warn && !duplicates.is_empty() {
            return DuplicateResolution::RequiresDecision {
                duplicates,
                new_items,
                options: DuplicateAction::resolution_options(),
            };
        }

        let items = Self::combine(new_items, &duplicates);
        DuplicateResolution::Resolved { items, duplicates }
    }

    /// 以人工决定（SKU → 动作）解析挂起的重复
    ///
    /// 已解析的结果中，决定中出现的 SKU 会被改判；缺少决定的挂起 SKU → DuplicateConflict
    pub fn apply_decisions(
        &self,
        resolution: &DuplicateResolution,
        decisions: &BTreeMap<String, DuplicateAction>,
    ) -> ImportResult<DuplicateResolution> {
        let (new_items, duplicates) = match resolution {
            DuplicateResolution::Resolved { items, duplicates } => (
                items
                    .iter()
                    .filter(|r| r.write_mode == WriteMode::Insert)
                    .cloned()
                    .collect::<Vec<_>>(),
                duplicates.clone(),
            ),
            DuplicateResolution::RequiresDecision {
                duplicates,
                new_items,
                ..
            } => (new_items.clone(), duplicates.clone()),
        };

        let mut unresolved = Vec::new();
        let decided: Vec<DuplicateRecord> = duplicates
            .into_iter()
            .map(|mut record| {
                let action = decisions
                    .get(&record.sku)
                    .copied()
                    .unwrap_or(record.resolution_action);
                if action == DuplicateAction::Pending {
                    unresolved.push(record.sku.clone());
                }
                record.resolution_action = action;
                record
            })
            .collect();

        if !unresolved.is_empty() {
            return Err(ImportError::DuplicateConflict {
                sku: unresolved.join(", "),
                message: "以下重复 SKU 缺少处理决定".to_string(),
            });
        }

        let items = Self::combine(new_items, &decided);
        Ok(DuplicateResolution::Resolved {
            items,
            duplicates: decided,
        })
    }

    /// 字段级合并: 新值非空则覆盖；单价与币种始终取新值；扩展字段取并集（新值优先）
    pub fn merge(existing: &CatalogItem, new_item: &ValidatedItem) -> ValidatedItem {
        let description = if new_item.description.trim().is_empty() {
            existing.description.clone()
        } else {
            new_item.description.clone()
        };

        let mut extra = existing.extra.clone();
        extra.extend(new_item.extra.iter().map(|(k, v)| (k.clone(), v.clone())));

        ValidatedItem {
            sku: new_item.sku.clone(),
            description,
            unit_price: new_item.unit_price,
            currency: new_item.currency.clone(),
            minimum_order_quantity: new_item
                .minimum_order_quantity
                .or(existing.minimum_order_quantity),
            unit_of_measure: new_item
                .unit_of_measure
                .clone()
                .or_else(|| existing.unit_of_measure.clone()),
            category: new_item.category.clone().or_else(|| existing.category.clone()),
            row_number: new_item.row_number,
            extra,
        }
    }

    fn index_snapshot(existing: &[CatalogItem]) -> HashMap<&str, &CatalogItem> {
        let mut snapshot: HashMap<&str, &CatalogItem> = HashMap::new();
        for item in existing {
            snapshot
                .entry(item.sku.as_str())
                .and_modify(|current| {
                    if item.item_id < current.item_id {
                        *current = item;
                    }
                })
                .or_insert(item);
        }
        snapshot
    }

    fn combine(new_items: Vec<ResolvedItem>, duplicates: &[DuplicateRecord]) -> Vec<ResolvedItem> {
        let mut items = new_items;
        for record in duplicates {
            let replace = WriteMode::Replace {
                existing_item_id: record.existing_item.item_id.clone(),
            };
            match record.resolution_action {
                DuplicateAction::Skip | DuplicateAction::Pending => {}
                DuplicateAction::Overwrite => items.push(ResolvedItem {
                    item: record.new_item.clone(),
                    write_mode: replace,
                }),
                DuplicateAction::Merge => items.push(ResolvedItem {
                    item: Self::merge(&record.existing_item, &record.new_item),
                    write_mode: replace,
                }),
            }
        }
        items.sort_by(|a, b| {
            a.item
                .row_number
                .cmp(&b.item.row_number)
                .then_with(|| a.item.sku.cmp(&b.item.sku))
        });
        items
    }
}
