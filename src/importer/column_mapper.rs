// ==========================================
// 价目表导入系统 - 列映射器
// ==========================================
// 阶段 1: 任意表头 → 标准字段
// 策略优先级:
//   1) 别名精确匹配（大小写不敏感，仅字母数字）；去括号注解后匹配
//   2) 人工反馈学到的映射
//   3) 模糊相似度（strsim，阈值可配，默认 0.7）
//   4) 正则/模式启发式；样本值价格启发式（intelligentParsing）
// 分配: 候选按 (分数降序, 策略优先级, 表头序, 字段序) 贪心，一列只分配一个字段
// 学习: 反馈写入可替换的 LearningStore，内存中仅保留加载后的副本
// ==========================================

use crate::domain::price_list::{
    ColumnMapping, FieldMatch, MappedRow, MappingSuggestion, MatchSource, ParsedTable,
};
use crate::domain::types::CanonicalField;
use crate::importer::data_cleaner::{detect_currency_marker, is_known_currency, normalize_price_token};
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::learning_store::InMemoryLearningStore;
use crate::importer::price_list_importer_trait::{LearnedWeight, LearningStore};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock, RwLock};
use tracing::{debug, info};

const EXACT_CONFIDENCE: f64 = 1.0;
const ANNOTATED_CONFIDENCE: f64 = 0.95;
const LEARNED_CONFIDENCE: f64 = 0.95;
const FUZZY_WEIGHT: f64 = 0.9;
const PATTERN_CONFIDENCE: f64 = 0.75;
const SAMPLE_CONFIDENCE: f64 = 0.72;
const SAMPLE_SIZE: usize = 20;
const SAMPLE_PRICE_RATIO: f64 = 0.8;
const MAX_SUGGESTIONS: usize = 3;

// "Price (USD)" / "Preis [€]" → ("Price", "USD")
static RE_ANNOTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)\s*[\(\[\{]([^\)\]\}]*)[\)\]\}]\s*$").expect("静态正则")
});

static FIELD_PATTERNS: LazyLock<Vec<(CanonicalField, Regex)>> = LazyLock::new(|| {
    let patterns = [
        (CanonicalField::Sku, r"(?i)(sku|\bcode\b|art(icle)?\.?\s*(no|nr|num)|part\s*(no|#|num)|item\s*(no|#|num|id)|\bref\b|material)"),
        (CanonicalField::Description, r"(?i)(desc|\bname\b|title|bezeichnung|libell|designation)"),
        (CanonicalField::UnitPrice, r"(?i)(price|cost|preis|prix|precio|\brate\b|amount|[\$€£¥])"),
        (CanonicalField::Currency, r"(?i)(curr|ccy|währung|devise|moneda)"),
        (CanonicalField::MinimumOrderQuantity, r"(?i)(moq|min(imum)?\.?\s*(order|qty|quantity|menge))"),
        (CanonicalField::UnitOfMeasure, r"(?i)(uom|unit\s*of|measure|einheit|\bpack)"),
        (CanonicalField::Category, r"(?i)(categ|kategor|group|family|\bclass\b)"),
    ];
    patterns
        .into_iter()
        .map(|(field, pattern)| (field, Regex::new(pattern).expect("静态正则")))
        .collect()
});

/// 表头规范化: 小写 + 仅保留字母数字
pub fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// 拆出括号注解: "Price (USD)" → Some(("Price", "USD"))
fn split_annotation(header: &str) -> Option<(String, String)> {
    let caps = RE_ANNOTATION.captures(header.trim())?;
    let base = caps.get(1)?.as_str().trim().to_string();
    let note = caps.get(2)?.as_str().trim().to_string();
    if base.is_empty() {
        return None;
    }
    Some((base, note))
}

/// 表头中携带的币种（注解优先，其次为独立的 ISO 代码词）
fn header_currency(header: &str) -> Option<String> {
    if let Some((_, note)) = split_annotation(header) {
        if let Some(code) = detect_currency_marker(&note) {
            return Some(code);
        }
    }
    header
        .split(|c: char| !c.is_alphanumeric())
        .find(|word| word.len() == 3 && word.chars().all(|c| c.is_ascii_uppercase()) && is_known_currency(word))
        .map(|word| word.to_string())
}

/// 表头币种跟随当前的单价列
fn refresh_inferred_currency(mapping: &mut ColumnMapping) {
    mapping.inferred_currency = mapping
        .fields
        .get(&CanonicalField::UnitPrice)
        .and_then(|m| header_currency(&m.header));
}

fn fuzzy_score(compact_header: &str, field: CanonicalField) -> f64 {
    if compact_header.is_empty() {
        return 0.0;
    }
    field
        .fuzzy_names()
        .iter()
        .map(|name| normalize_header(name))
        .chain(field.aliases().iter().map(|a| a.to_string()))
        .map(|name| strsim::normalized_levenshtein(compact_header, &name))
        .fold(0.0, f64::max)
}

#[derive(Debug, Clone)]
struct Candidate {
    field: CanonicalField,
    header_index: usize,
    score: f64,
    source: MatchSource,
}

// ==========================================
// ColumnMapper
// ==========================================
pub struct ColumnMapper {
    store: Arc<dyn LearningStore>,
    weights: RwLock<HashMap<(String, CanonicalField), LearnedWeight>>,
    fuzzy_threshold: f64,
}

impl ColumnMapper {
    /// 创建映射器并从存储加载学习权重
    pub fn new(store: Arc<dyn LearningStore>, fuzzy_threshold: f64) -> ImportResult<Self> {
        let loaded = store.load_all()?;
        let weights = loaded
            .into_iter()
            .map(|w| ((w.header_key.clone(), w.field), w))
            .collect::<HashMap<_, _>>();
        info!(weights = weights.len(), fuzzy_threshold, "列映射器初始化完成");
        Ok(Self {
            store,
            weights: RwLock::new(weights),
            fuzzy_threshold,
        })
    }

    /// 无持久化的映射器（测试/一次性场景）
    pub fn in_memory(fuzzy_threshold: f64) -> Self {
        Self {
            store: Arc::new(InMemoryLearningStore::new()),
            weights: RwLock::new(HashMap::new()),
            fuzzy_threshold,
        }
    }

    fn weights_snapshot(&self) -> ImportResult<HashMap<(String, CanonicalField), LearnedWeight>> {
        self.weights
            .read()
            .map(|w| w.clone())
            .map_err(|e| ImportError::SystemError(format!("锁获取失败: {}", e)))
    }

    /// 仅根据表头映射（不看样本值）
    pub fn map_headers(&self, headers: &[String]) -> ImportResult<ColumnMapping> {
        self.build_mapping(headers, None)
    }

    /// 根据表头 + 样本值映射
    pub fn map_columns(&self, table: &ParsedTable, intelligent_parsing: bool) -> ImportResult<ColumnMapping> {
        let samples = if intelligent_parsing { Some(table) } else { None };
        self.build_mapping(&table.headers, samples)
    }

    fn build_mapping(&self, headers: &[String], samples: Option<&ParsedTable>) -> ImportResult<ColumnMapping> {
        let weights = self.weights_snapshot()?;
        let keys: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
        let is_excluded = |index: usize, field: CanonicalField| {
            weights
                .get(&(keys[index].clone(), field))
                .map(|w| w.is_excluded())
                .unwrap_or(false)
        };

        let mut candidates: Vec<Candidate> = Vec::new();
        for (index, header) in headers.iter().enumerate() {
            let key = &keys[index];

            // 1) 精确匹配
            for field in CanonicalField::ALL {
                if field.aliases().contains(&key.as_str()) {
                    candidates.push(Candidate {
                        field,
                        header_index: index,
                        score: EXACT_CONFIDENCE,
                        source: MatchSource::Exact,
                    });
                }
            }
            if let Some((base, _)) = split_annotation(header) {
                let base_key = normalize_header(&base);
                for field in CanonicalField::ALL {
                    if field.aliases().contains(&base_key.as_str()) {
                        candidates.push(Candidate {
                            field,
                            header_index: index,
                            score: ANNOTATED_CONFIDENCE,
                            source: MatchSource::Annotated,
                        });
                    }
                }
            }

            // 2) 学习结果: 净确认数最大的字段
            let learned = weights
                .values()
                .filter(|w| &w.header_key == key && w.net() > 0)
                .max_by(|a, b| a.net().cmp(&b.net()).then(b.field.cmp(&a.field)));
            if let Some(weight) = learned {
                candidates.push(Candidate {
                    field: weight.field,
                    header_index: index,
                    score: LEARNED_CONFIDENCE,
                    source: MatchSource::Learned,
                });
            }

            // 3) 模糊匹配
            for field in CanonicalField::ALL {
                let score = fuzzy_score(key, field);
                if score >= self.fuzzy_threshold {
                    candidates.push(Candidate {
                        field,
                        header_index: index,
                        score: score * FUZZY_WEIGHT,
                        source: MatchSource::Fuzzy,
                    });
                }
            }

            // 4) 模式启发式
            for (field, pattern) in FIELD_PATTERNS.iter() {
                if pattern.is_match(header) {
                    candidates.push(Candidate {
                        field: *field,
                        header_index: index,
                        score: PATTERN_CONFIDENCE,
                        source: MatchSource::Pattern,
                    });
                }
            }
        }

        candidates.retain(|c| !is_excluded(c.header_index, c.field));
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.source.cmp(&b.source))
                .then(a.header_index.cmp(&b.header_index))
                .then(a.field.cmp(&b.field))
        });

        let mut mapping = ColumnMapping {
            headers: headers.to_vec(),
            ..ColumnMapping::default()
        };
        for candidate in candidates {
            let header_taken = mapping
                .fields
                .values()
                .any(|m| m.header_index == candidate.header_index);
            if mapping.fields.contains_key(&candidate.field) || header_taken {
                continue;
            }
            mapping.fields.insert(
                candidate.field,
                FieldMatch {
                    header_index: candidate.header_index,
                    header: headers[candidate.header_index].clone(),
                    confidence: candidate.score,
                    source: candidate.source,
                },
            );
        }

        // 样本值启发式: 单价仍未映射时
        if let Some(table) = samples {
            if !mapping.fields.contains_key(&CanonicalField::UnitPrice) {
                if let Some(index) = self.price_column_from_samples(table, &mapping, &is_excluded) {
                    mapping.fields.insert(
                        CanonicalField::UnitPrice,
                        FieldMatch {
                            header_index: index,
                            header: headers[index].clone(),
                            confidence: SAMPLE_CONFIDENCE,
                            source: MatchSource::SampleValues,
                        },
                    );
                }
            }
        }

        refresh_inferred_currency(&mut mapping);
        mapping.refresh_unmapped();
        mapping.suggestions = self.suggest(&mapping, &keys, &is_excluded);

        debug!(
            mapped = mapping.fields.len(),
            unmapped = mapping.unmapped_headers.len(),
            mean_confidence = mapping.mean_confidence(),
            "列映射完成"
        );
        Ok(mapping)
    }

    fn price_column_from_samples(
        &self,
        table: &ParsedTable,
        mapping: &ColumnMapping,
        is_excluded: &dyn Fn(usize, CanonicalField) -> bool,
    ) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for index in 0..table.headers.len() {
            if mapping.fields.values().any(|m| m.header_index == index)
                || is_excluded(index, CanonicalField::UnitPrice)
            {
                continue;
            }
            let samples = table.column_samples(index, SAMPLE_SIZE);
            if samples.is_empty() {
                continue;
            }
            let tokens: Vec<_> = samples.iter().filter_map(|s| normalize_price_token(s)).collect();
            let ratio = tokens.len() as f64 / samples.len() as f64;
            // 纯整数列多半是编号/数量
            let looks_monetary = tokens
                .iter()
                .any(|t| t.currency.is_some() || t.amount.scale() > 0);
            if ratio >= SAMPLE_PRICE_RATIO
                && looks_monetary
                && best.map(|(_, r)| ratio > r).unwrap_or(true)
            {
                best = Some((index, ratio));
            }
        }
        best.map(|(index, _)| index)
    }

    /// 未映射的必填字段: 剩余表头按模糊分数给出前 3 个候选
    fn suggest(
        &self,
        mapping: &ColumnMapping,
        keys: &[String],
        is_excluded: &dyn Fn(usize, CanonicalField) -> bool,
    ) -> BTreeMap<CanonicalField, Vec<MappingSuggestion>> {
        let mut suggestions = BTreeMap::new();
        for field in mapping.missing_required() {
            let mut ranked: Vec<MappingSuggestion> = mapping
                .headers
                .iter()
                .enumerate()
                .filter(|(i, _)| !mapping.fields.values().any(|m| m.header_index == *i))
                .filter(|(i, _)| !is_excluded(*i, field))
                .map(|(i, header)| MappingSuggestion {
                    header_index: i,
                    header: header.clone(),
                    score: fuzzy_score(&keys[i], field),
                })
                .filter(|s| s.score > 0.0)
                .collect();
            ranked.sort_by(|a, b| {
                b.score
                    .total_cmp(&a.score)
                    .then(a.header_index.cmp(&b.header_index))
            });
            ranked.truncate(MAX_SUGGESTIONS);
            suggestions.insert(field, ranked);
        }
        suggestions
    }

    /// 人工重映射，单价列变化时重新推断表头币种
    pub fn apply_override(mapping: &mut ColumnMapping, field: CanonicalField, header: &str) -> ImportResult<()> {
        mapping
            .apply_override(field, header)
            .map_err(ImportError::InvalidOptions)?;
        refresh_inferred_currency(mapping);
        Ok(())
    }

    /// 按映射拆分数据行: 标准字段 + 扩展字段
    pub fn map_rows(table: &ParsedTable, mapping: &ColumnMapping) -> Vec<MappedRow> {
        let field_by_index: HashMap<usize, CanonicalField> = mapping
            .fields
            .iter()
            .map(|(field, m)| (m.header_index, *field))
            .collect();

        table
            .rows
            .iter()
            .map(|row| {
                let mut mapped = MappedRow {
                    row_number: row.row_number,
                    values: BTreeMap::new(),
                    extra: BTreeMap::new(),
                };
                for (index, header) in table.headers.iter().enumerate() {
                    let value = row.value(index).unwrap_or("").trim();
                    match field_by_index.get(&index) {
                        Some(field) => {
                            mapped.values.insert(*field, value.to_string());
                        }
                        None if !value.is_empty() => {
                            mapped.extra.insert(header.clone(), value.to_string());
                        }
                        None => {}
                    }
                }
                mapped
            })
            .collect()
    }

    /// 人工反馈: 确认或否定 (表头, 字段)
    pub fn learn_from_feedback(
        &self,
        header: &str,
        field: CanonicalField,
        is_correct: bool,
    ) -> ImportResult<LearnedWeight> {
        let key = normalize_header(header);
        if key.is_empty() {
            return Err(ImportError::InvalidOptions(format!("表头无有效字符: {:?}", header)));
        }

        let weight = {
            let mut weights = self
                .weights
                .write()
                .map_err(|e| ImportError::SystemError(format!("锁获取失败: {}", e)))?;
            let weight = weights
                .entry((key.clone(), field))
                .or_insert_with(|| LearnedWeight::new(key.clone(), field));
            if is_correct {
                weight.confirmations += 1;
            } else {
                weight.rejections += 1;
            }
            weight.clone()
        };

        self.store.save(&weight)?;
        info!(
            header = %header,
            field = %field,
            is_correct,
            confirmations = weight.confirmations,
            rejections = weight.rejections,
            "列映射反馈已记录"
        );
        Ok(weight)
    }
}
