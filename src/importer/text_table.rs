// ==========================================
// 价目表导入系统 - 文本表格启发式
// ==========================================
// 用途: PDF / Word 段落 / 邮件正文等纯文本 → 表格
// 切分: 制表符 > 竖线 > 分号 > 连续空格 > "首词 + 中间 + 末尾价格"
// 表头: 第一条不含价格记号的多列行
// 数据: 至少含一个价格记号的多列行
// ==========================================

use crate::domain::price_list::ParsedTable;
use crate::domain::types::FileFormat;
use crate::importer::data_cleaner::normalize_price_token;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::file_parser::TableBuilder;
use crate::importer::price_list_importer_trait::ParseOptions;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static RE_WIDE_GAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("静态正则"));

/// 将一行文本切分为单元格
pub fn split_cells(line: &str) -> Vec<String> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }

    let cells: Vec<String> = if line.contains('\t') {
        line.split('\t').map(|c| c.trim().to_string()).collect()
    } else if line.contains('|') {
        line.trim_matches('|')
            .split('|')
            .map(|c| c.trim().to_string())
            .collect()
    } else if line.matches(';').count() >= 1 {
        line.split(';').map(|c| c.trim().to_string()).collect()
    } else {
        let wide: Vec<String> = RE_WIDE_GAP
            .split(line)
            .map(|c| c.trim().to_string())
            .collect();
        if wide.len() >= 2 {
            wide
        } else {
            split_single_spaced(line)
        }
    };

    // 去掉全空列（如 "||" 产生的空串）
    cells.into_iter().filter(|c| !c.is_empty()).collect()
}

/// 单空格行: "SKU1 Blue widget 12.50" → ["SKU1", "Blue widget", "12.50"]
fn split_single_spaced(line: &str) -> Vec<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() >= 3 && is_money_like(tokens[tokens.len() - 1]) {
        vec![
            tokens[0].to_string(),
            tokens[1..tokens.len() - 1].join(" "),
            tokens[tokens.len() - 1].to_string(),
        ]
    } else {
        vec![line.to_string()]
    }
}

fn is_price_like(cell: &str) -> bool {
    normalize_price_token(cell).is_some()
}

/// 比 is_price_like 更严: 需带小数位或币种（排除 "2024" 这类年份）
fn is_money_like(cell: &str) -> bool {
    match normalize_price_token(cell) {
        Some(token) => token.currency.is_some() || token.amount.scale() > 0,
        None => false,
    }
}

/// 从纯文本中提取表格
pub fn extract_table(text: &str, format: FileFormat, options: &ParseOptions) -> ImportResult<ParsedTable> {
    let mut builder = TableBuilder::new(format, options);
    let mut pending_header: Option<Vec<String>> = None;
    let mut width = 0usize;

    for line in text.lines() {
        let cells = split_cells(line);
        if cells.len() < 2 {
            continue;
        }
        let has_price = cells.iter().any(|c| is_price_like(c));

        if !builder.has_headers() {
            if !has_price {
                // 最近一条无价格的多列行视为表头
                pending_header = Some(cells);
                continue;
            }
            let headers = match pending_header.take() {
                Some(h) => h,
                // 无表头: 使用空表头，由唯一化生成 "Column N"
                None => vec![String::new(); cells.len()],
            };
            width = headers.len();
            builder.set_headers(headers);
        }

        if has_price {
            builder.push_row(align_to_width(cells, width))?;
        }
    }

    if !builder.has_headers() {
        return Err(ImportError::ParseError(format!(
            "{} 文本中未识别出价目表格",
            format
        )));
    }
    debug!(format = %format, "文本表格提取完成");
    builder.finish()
}

/// 单元格多于表头时，将中间多出的部分并入第二列（通常是描述）
fn align_to_width(cells: Vec<String>, width: usize) -> Vec<String> {
    if width < 3 || cells.len() <= width {
        return cells;
    }
    let extra = cells.len() - width;
    let mut aligned = Vec::with_capacity(width);
    aligned.push(cells[0].clone());
    aligned.push(cells[1..=1 + extra].join(" "));
    aligned.extend(cells[2 + extra..].iter().cloned());
    aligned
}
