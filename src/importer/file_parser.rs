// ==========================================
// 价目表导入系统 - 文件解析器实现
// ==========================================
// 阶段 0: 文件字节 → 表头 + 数据行
// 结构化: CSV / Excel / JSON / XML（确定性解析）
// 非结构化: PDF / Word / Email 见 document_parser.rs
// 分发: ParserRegistry 按检测出的格式选取实现
// ==========================================

use crate::domain::price_list::{ParsedRow, ParsedTable};
use crate::domain::types::FileFormat;
use crate::importer::document_parser::{EmailParser, PdfParser, WordParser};
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::price_list_importer_trait::{FormatParser, ParseOptions};
use calamine::{open_workbook_auto_from_rs, Reader};
use csv::ReaderBuilder;
use quick_xml::events::{BytesRef, BytesStart, Event};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

// ==========================================
// 格式检测
// ==========================================

/// 通用 MIME: 需回退到扩展名判断
const GENERIC_MIME_TYPES: &[&str] = &["", "application/octet-stream", "text/plain", "binary/octet-stream"];

fn format_from_mime(mime: &str) -> Option<FileFormat> {
    let essence = mime.split(';').next().unwrap_or("").trim().to_lowercase();
    let format = match essence.as_str() {
        "text/csv" | "application/csv" | "text/comma-separated-values" | "text/tab-separated-values" => {
            FileFormat::Csv
        }
        "application/vnd.ms-excel"
        | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        | "application/vnd.ms-excel.sheet.macroenabled.12" => FileFormat::Excel,
        "application/json" | "text/json" => FileFormat::Json,
        "application/xml" | "text/xml" => FileFormat::Xml,
        "application/pdf" => FileFormat::Pdf,
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            FileFormat::Word
        }
        "message/rfc822" => FileFormat::Email,
        _ => return None,
    };
    Some(format)
}

fn format_from_extension(file_name: &str) -> Option<FileFormat> {
    let ext = file_name.rsplit_once('.')?.1.to_lowercase();
    let format = match ext.as_str() {
        "csv" | "tsv" => FileFormat::Csv,
        "xlsx" | "xls" | "xlsm" => FileFormat::Excel,
        "json" => FileFormat::Json,
        "xml" => FileFormat::Xml,
        "pdf" => FileFormat::Pdf,
        "docx" => FileFormat::Word,
        "eml" => FileFormat::Email,
        _ => return None,
    };
    Some(format)
}

/// 根据 MIME/扩展名判断格式
///
/// 已知 MIME 优先；通用 MIME（octet-stream、text/plain、空）回退到扩展名
pub fn detect_format(file_name: &str, mime_type: &str) -> ImportResult<FileFormat> {
    if let Some(format) = format_from_mime(mime_type) {
        return Ok(format);
    }
    let essence = mime_type.split(';').next().unwrap_or("").trim().to_lowercase();
    if GENERIC_MIME_TYPES.contains(&essence.as_str()) {
        if let Some(format) = format_from_extension(file_name) {
            return Ok(format);
        }
    }
    Err(ImportError::UnsupportedFormat(format!(
        "{} ({})",
        file_name,
        if mime_type.is_empty() { "未声明 MIME" } else { mime_type }
    )))
}

// ==========================================
// 解析器注册表
// ==========================================
pub struct ParserRegistry {
    parsers: HashMap<FileFormat, Arc<dyn FormatParser>>,
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// 注册全部内置格式
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(CsvParser));
        registry.register(Arc::new(ExcelParser));
        registry.register(Arc::new(JsonParser));
        registry.register(Arc::new(XmlParser));
        registry.register(Arc::new(PdfParser));
        registry.register(Arc::new(WordParser));
        registry.register(Arc::new(EmailParser::with_default_attachment_parsers()));
        registry
    }

    /// 注册或替换某格式的解析器
    pub fn register(&mut self, parser: Arc<dyn FormatParser>) {
        self.parsers.insert(parser.format(), parser);
    }

    pub fn get(&self, format: FileFormat) -> Option<Arc<dyn FormatParser>> {
        self.parsers.get(&format).cloned()
    }

    /// 检测格式并返回对应解析器
    pub fn resolve(&self, file_name: &str, mime_type: &str) -> ImportResult<Arc<dyn FormatParser>> {
        let format = detect_format(file_name, mime_type)?;
        self.get(format).ok_or_else(|| {
            ImportError::UnsupportedFormat(format!("{} 格式未注册解析器", format))
        })
    }

    /// 字节上限检查（解码前）
    pub fn check_size(&self, size: u64, options: &ParseOptions) -> ImportResult<()> {
        if size > options.max_bytes {
            return Err(ImportError::FileTooLarge {
                size,
                limit: options.max_bytes,
            });
        }
        Ok(())
    }

    /// 同步解析入口（检测 + 大小检查 + 解析）
    pub fn parse(
        &self,
        bytes: &[u8],
        file_name: &str,
        mime_type: &str,
        options: &ParseOptions,
    ) -> ImportResult<ParsedTable> {
        self.check_size(bytes.len() as u64, options)?;
        let parser = self.resolve(file_name, mime_type)?;
        parser.parse(bytes, options)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ==========================================
// 表格构建器（各解析器共用）
// ==========================================
// - 空白行跳过（行号仍按源数据行计数）
// - 行数上限在读取过程中检查
// - 空白/重复表头唯一化: "Column 3" / "Price (2)"
pub(crate) struct TableBuilder {
    format: FileFormat,
    heuristic: bool,
    max_rows: usize,
    headers: Vec<String>,
    rows: Vec<ParsedRow>,
    source_rows: usize,
}

impl TableBuilder {
    pub(crate) fn new(format: FileFormat, options: &ParseOptions) -> Self {
        Self {
            format,
            heuristic: !format.is_structured(),
            max_rows: options.max_rows,
            headers: Vec::new(),
            rows: Vec::new(),
            source_rows: 0,
        }
    }

    pub(crate) fn set_headers(&mut self, headers: Vec<String>) {
        self.headers = headers.into_iter().map(|h| h.trim().to_string()).collect();
    }

    pub(crate) fn has_headers(&self) -> bool {
        !self.headers.is_empty()
    }

    pub(crate) fn push_row(&mut self, values: Vec<String>) -> ImportResult<()> {
        self.source_rows += 1;
        let values: Vec<String> = values.into_iter().map(|v| v.trim().to_string()).collect();
        if values.iter().all(|v| v.is_empty()) {
            return Ok(());
        }
        if self.rows.len() >= self.max_rows {
            return Err(ImportError::RowLimitExceeded {
                limit: self.max_rows,
            });
        }
        self.rows.push(ParsedRow {
            row_number: self.source_rows,
            values,
        });
        Ok(())
    }

    pub(crate) fn finish(self) -> ImportResult<ParsedTable> {
        if self.headers.iter().all(|h| h.is_empty()) {
            return Err(ImportError::ParseError(format!(
                "{} 文件未找到表头",
                self.format
            )));
        }
        if self.rows.is_empty() {
            return Err(ImportError::ParseError(format!(
                "{} 文件无数据行",
                self.format
            )));
        }

        // 表头数少于最宽数据行时补齐
        let width = self
            .rows
            .iter()
            .map(|r| r.values.len())
            .max()
            .unwrap_or(0)
            .max(self.headers.len());
        let mut headers = self.headers;
        headers.resize(width, String::new());

        debug!(
            format = %self.format,
            headers = headers.len(),
            rows = self.rows.len(),
            "表格解析完成"
        );

        Ok(ParsedTable {
            format: self.format,
            headers: unique_headers(headers),
            rows: self.rows,
            heuristic: self.heuristic,
        })
    }
}

pub(crate) fn unique_headers(headers: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    headers
        .into_iter()
        .enumerate()
        .map(|(i, header)| {
            let base = if header.trim().is_empty() {
                format!("Column {}", i + 1)
            } else {
                header.trim().to_string()
            };
            let count = seen.entry(base.to_lowercase()).or_insert(0);
            *count += 1;
            if *count == 1 {
                base
            } else {
                format!("{} ({})", base, count)
            }
        })
        .collect()
}

// ==========================================
// CSV Parser 实现
// ==========================================
pub struct CsvParser;

impl CsvParser {
    /// 在首个非空行上统计候选分隔符（引号内不计）
    fn sniff_delimiter(text: &str) -> u8 {
        let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let mut best = (b',', 0usize);
        for candidate in [b',', b';', b'\t', b'|'] {
            let mut in_quotes = false;
            let mut count = 0;
            for byte in first_line.bytes() {
                if byte == b'"' {
                    in_quotes = !in_quotes;
                } else if byte == candidate && !in_quotes {
                    count += 1;
                }
            }
            if count > best.1 {
                best = (candidate, count);
            }
        }
        best.0
    }
}

impl FormatParser for CsvParser {
    fn format(&self) -> FileFormat {
        FileFormat::Csv
    }

    fn parse(&self, bytes: &[u8], options: &ParseOptions) -> ImportResult<ParsedTable> {
        // 去除 UTF-8 BOM
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let text = String::from_utf8_lossy(bytes);
        let delimiter = Self::sniff_delimiter(&text);

        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true) // 允许行长度不一致
            .delimiter(delimiter)
            .from_reader(text.as_bytes());

        let mut builder = TableBuilder::new(FileFormat::Csv, options);
        for result in reader.records() {
            let record = result?;
            let values: Vec<String> = record.iter().map(|v| v.to_string()).collect();
            if !builder.has_headers() {
                if values.iter().all(|v| v.trim().is_empty()) {
                    continue;
                }
                builder.set_headers(values);
                continue;
            }
            builder.push_row(values)?;
        }

        builder.finish()
    }
}

// ==========================================
// Excel Parser 实现
// ==========================================
pub struct ExcelParser;

impl FormatParser for ExcelParser {
    fn format(&self) -> FileFormat {
        FileFormat::Excel
    }

    fn parse(&self, bytes: &[u8], options: &ParseOptions) -> ImportResult<ParsedTable> {
        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;

        let sheet_names = workbook.sheet_names();
        if sheet_names.is_empty() {
            return Err(ImportError::ParseError("Excel 文件无工作表".to_string()));
        }

        // 取第一个非空工作表
        for sheet_name in sheet_names {
            let range = workbook.worksheet_range(&sheet_name)?;
            let is_empty = range
                .rows()
                .all(|row| row.iter().all(|cell| cell.to_string().trim().is_empty()));
            if is_empty {
                debug!(sheet = %sheet_name, "跳过空工作表");
                continue;
            }

            let mut builder = TableBuilder::new(FileFormat::Excel, options);
            for row in range.rows() {
                let values: Vec<String> = row.iter().map(|cell| cell.to_string()).collect();
                if !builder.has_headers() {
                    if values.iter().all(|v| v.trim().is_empty()) {
                        continue;
                    }
                    builder.set_headers(values);
                    continue;
                }
                builder.push_row(values)?;
            }
            return builder.finish();
        }

        Err(ImportError::ParseError("Excel 文件所有工作表均为空".to_string()))
    }
}

// ==========================================
// JSON Parser 实现
// ==========================================
// 支持: 对象数组 / 含表头行的二维数组 / 以首个数组字段包裹上述两者的对象
pub struct JsonParser;

impl JsonParser {
    fn cell_text(value: &Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => other.to_string(),
        }
    }

    fn locate_records(value: &Value) -> Option<&Vec<Value>> {
        match value {
            Value::Array(items) => Some(items),
            Value::Object(map) => map.values().find_map(|v| match v {
                Value::Array(items) => Some(items),
                _ => None,
            }),
            _ => None,
        }
    }
}

impl FormatParser for JsonParser {
    fn format(&self) -> FileFormat {
        FileFormat::Json
    }

    fn parse(&self, bytes: &[u8], options: &ParseOptions) -> ImportResult<ParsedTable> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let root: Value = serde_json::from_slice(bytes)?;
        let records = Self::locate_records(&root).ok_or_else(|| {
            ImportError::ParseError("JSON 中未找到记录数组".to_string())
        })?;

        let mut builder = TableBuilder::new(FileFormat::Json, options);
        match records.first() {
            Some(Value::Array(header_row)) => {
                builder.set_headers(header_row.iter().map(Self::cell_text).collect());
                for record in records.iter().skip(1) {
                    match record {
                        Value::Array(cells) => {
                            builder.push_row(cells.iter().map(Self::cell_text).collect())?
                        }
                        _ => {
                            return Err(ImportError::ParseError(
                                "JSON 二维数组中混入了非数组元素".to_string(),
                            ))
                        }
                    }
                }
            }
            Some(Value::Object(_)) => {
                // 表头 = 各对象键的并集（按首次出现顺序）
                let mut headers: Vec<String> = Vec::new();
                for record in records {
                    if let Value::Object(map) = record {
                        for key in map.keys() {
                            if !headers.contains(key) {
                                headers.push(key.clone());
                            }
                        }
                    }
                }
                builder.set_headers(headers.clone());
                for record in records {
                    let Value::Object(map) = record else {
                        return Err(ImportError::ParseError(
                            "JSON 对象数组中混入了非对象元素".to_string(),
                        ));
                    };
                    let values = headers
                        .iter()
                        .map(|h| map.get(h).map(Self::cell_text).unwrap_or_default())
                        .collect();
                    builder.push_row(values)?;
                }
            }
            _ => {}
        }

        builder.finish()
    }
}

/// 实体引用 → 文本（字符引用与预定义实体；未知实体原样保留）
pub(crate) fn resolve_entity_ref(reference: &BytesRef<'_>) -> ImportResult<String> {
    let invalid = |e: &dyn std::fmt::Display| ImportError::ParseError(format!("XML 实体引用错误: {}", e));
    if let Some(ch) = reference.resolve_char_ref().map_err(|e| invalid(&e))? {
        return Ok(ch.to_string());
    }
    let name = reference.decode().map_err(|e| invalid(&e))?;
    Ok(match quick_xml::escape::resolve_predefined_entity(&name) {
        Some(value) => value.to_string(),
        None => format!("&{};", name),
    })
}

// ==========================================
// XML Parser 实现
// ==========================================
// 记录元素: 同名兄弟元素中数量最多的一组，且其成员含叶子子元素或属性
// 字段: 属性 + 叶子子元素文本
pub struct XmlParser;

#[derive(Debug, Default)]
struct XmlNode {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn is_record_like(&self) -> bool {
        !self.attributes.is_empty() || self.children.iter().any(|c| c.is_leaf())
    }
}

impl XmlParser {
    fn node_from_start(start: &BytesStart) -> ImportResult<XmlNode> {
        let mut node = XmlNode {
            name: String::from_utf8_lossy(start.local_name().as_ref()).to_string(),
            ..XmlNode::default()
        };
        for attr in start.attributes() {
            let attr = attr.map_err(|e| ImportError::ParseError(format!("XML 属性错误: {}", e)))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_string();
            let value = attr
                .unescape_value()
                .map_err(|e| ImportError::ParseError(format!("XML 属性值错误: {}", e)))?
                .to_string();
            node.attributes.push((key, value));
        }
        Ok(node)
    }

    fn build_tree(text: &str) -> ImportResult<XmlNode> {
        // 实体引用单独成事件，文本不能逐段修剪，叶子闭合时再修剪
        let mut reader = quick_xml::Reader::from_str(text);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<XmlNode> = vec![XmlNode {
            name: "#document".to_string(),
            ..XmlNode::default()
        }];

        loop {
            match reader.read_event()? {
                Event::Start(ref e) => stack.push(Self::node_from_start(e)?),
                Event::Empty(ref e) => {
                    let node = Self::node_from_start(e)?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(node);
                    }
                }
                Event::End(_) => {
                    if stack.len() < 2 {
                        return Err(ImportError::ParseError("XML 结束标签不匹配".to_string()));
                    }
                    if let Some(mut node) = stack.pop() {
                        node.text = node.text.trim().to_string();
                        if let Some(parent) = stack.last_mut() {
                            parent.children.push(node);
                        }
                    }
                }
                Event::Text(e) => {
                    let decoded = e
                        .decode()
                        .map_err(|err| ImportError::ParseError(format!("XML 文本错误: {}", err)))?;
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&decoded);
                    }
                }
                Event::GeneralRef(r) => {
                    let resolved = resolve_entity_ref(&r)?;
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&resolved);
                    }
                }
                Event::CData(e) => {
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&String::from_utf8_lossy(&e));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if stack.len() != 1 {
            return Err(ImportError::ParseError("XML 文档不完整".to_string()));
        }
        stack
            .pop()
            .ok_or_else(|| ImportError::ParseError("XML 文档为空".to_string()))
    }

    /// 深度优先找出最大的同名记录组
    fn find_records(node: &XmlNode) -> Option<Vec<&XmlNode>> {
        let mut best: Option<Vec<&XmlNode>> = None;

        let mut groups: Vec<(&str, Vec<&XmlNode>)> = Vec::new();
        for child in &node.children {
            if !child.is_record_like() {
                continue;
            }
            match groups.iter_mut().find(|(name, _)| *name == child.name) {
                Some((_, members)) => members.push(child),
                None => groups.push((child.name.as_str(), vec![child])),
            }
        }
        for (_, members) in groups {
            if best.as_ref().map(|b| members.len() > b.len()).unwrap_or(true) {
                best = Some(members);
            }
        }

        for child in &node.children {
            if let Some(candidate) = Self::find_records(child) {
                if best
                    .as_ref()
                    .map(|b| candidate.len() > b.len())
                    .unwrap_or(true)
                {
                    best = Some(candidate);
                }
            }
        }
        best
    }
}

impl FormatParser for XmlParser {
    fn format(&self) -> FileFormat {
        FileFormat::Xml
    }

    fn parse(&self, bytes: &[u8], options: &ParseOptions) -> ImportResult<ParsedTable> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let text = String::from_utf8_lossy(bytes);
        let root = Self::build_tree(&text)?;
        let records = Self::find_records(&root)
            .ok_or_else(|| ImportError::ParseError("XML 中未找到记录元素".to_string()))?;

        let mut headers: Vec<String> = Vec::new();
        for record in &records {
            let keys = record
                .attributes
                .iter()
                .map(|(k, _)| k)
                .chain(record.children.iter().filter(|c| c.is_leaf()).map(|c| &c.name));
            for key in keys {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
        }

        let mut builder = TableBuilder::new(FileFormat::Xml, options);
        builder.set_headers(headers.clone());
        for record in &records {
            let values = headers
                .iter()
                .map(|h| {
                    record
                        .children
                        .iter()
                        .find(|c| c.is_leaf() && &c.name == h)
                        .map(|c| c.text.clone())
                        .or_else(|| {
                            record
                                .attributes
                                .iter()
                                .find(|(k, _)| k == h)
                                .map(|(_, v)| v.clone())
                        })
                        .unwrap_or_default()
                })
                .collect();
            builder.push_row(values)?;
        }

        builder.finish()
    }
}
