// ==========================================
// 价目表导入系统 - 非结构化文档解析器
// ==========================================
// PDF:   lopdf 逐页提取文本 → 文本表格启发式
// Word:  .docx (zip + quick-xml)，优先取表格，否则段落文本启发式
// Email: mail-parser，优先解析结构化附件，否则正文文本启发式
// 调用方负责超时控制（spawn_blocking + timeout）
// ==========================================

use crate::domain::price_list::ParsedTable;
use crate::domain::types::FileFormat;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::file_parser::{
    detect_format, resolve_entity_ref, CsvParser, ExcelParser, JsonParser, TableBuilder, XmlParser,
};
use crate::importer::price_list_importer_trait::{FormatParser, ParseOptions};
use crate::importer::text_table::extract_table;
use mail_parser::{MessageParser, MimeHeaders};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::{debug, info};

// ==========================================
// PDF Parser 实现
// ==========================================
pub struct PdfParser;

impl FormatParser for PdfParser {
    fn format(&self) -> FileFormat {
        FileFormat::Pdf
    }

    fn parse(&self, bytes: &[u8], options: &ParseOptions) -> ImportResult<ParsedTable> {
        let doc = lopdf::Document::load_mem(bytes)?;

        let mut text = String::new();
        for (page_num, _) in doc.get_pages() {
            match doc.extract_text(&[page_num]) {
                Ok(page_text) => {
                    text.push_str(&page_text);
                    text.push('\n');
                }
                Err(e) => debug!(page = page_num, error = %e, "PDF 页面文本提取失败，跳过"),
            }
        }

        if text.trim().is_empty() {
            return Err(ImportError::ParseError(
                "PDF 中没有可提取的文本（扫描件需先 OCR）".to_string(),
            ));
        }
        extract_table(&text, FileFormat::Pdf, options)
    }
}

// ==========================================
// Word (.docx) Parser 实现
// ==========================================
pub struct WordParser;

/// document.xml 的解析结果
#[derive(Debug, Default)]
struct DocxContent {
    tables: Vec<Vec<Vec<String>>>, // 表 → 行 → 单元格
    paragraphs: Vec<String>,
}

impl WordParser {
    fn read_document_xml(bytes: &[u8]) -> ImportResult<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut document_xml = archive.by_name("word/document.xml")?;
        let mut xml = String::new();
        document_xml.read_to_string(&mut xml)?;
        Ok(xml)
    }

    fn parse_document_xml(xml: &str) -> ImportResult<DocxContent> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut content = DocxContent::default();
        let mut table_depth = 0usize;
        let mut in_text = false;
        let mut paragraph = String::new();
        let mut cell = String::new();
        let mut row: Vec<String> = Vec::new();
        let mut table: Vec<Vec<String>> = Vec::new();

        loop {
            match reader.read_event()? {
                Event::Start(ref e) => match e.local_name().as_ref() {
                    b"tbl" => table_depth += 1,
                    b"t" => in_text = true,
                    _ => {}
                },
                Event::Empty(ref e) => match e.local_name().as_ref() {
                    // 制表符与换行在单元格/段落内保留为空格
                    b"tab" | b"br" => {
                        if table_depth > 0 {
                            cell.push(' ');
                        } else {
                            paragraph.push('\t');
                        }
                    }
                    _ => {}
                },
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"t" => in_text = false,
                    b"p" => {
                        if table_depth > 0 {
                            if !cell.is_empty() {
                                cell.push(' ');
                            }
                        } else {
                            content.paragraphs.push(std::mem::take(&mut paragraph));
                        }
                    }
                    // 只收集最外层表格
                    b"tc" if table_depth == 1 => row.push(std::mem::take(&mut cell).trim().to_string()),
                    b"tr" if table_depth == 1 => table.push(std::mem::take(&mut row)),
                    b"tbl" => {
                        table_depth = table_depth.saturating_sub(1);
                        if table_depth == 0 {
                            content.tables.push(std::mem::take(&mut table));
                        }
                    }
                    _ => {}
                },
                Event::Text(e) => {
                    if in_text {
                        let decoded = e
                            .decode()
                            .map_err(|err| ImportError::ParseError(format!("DOCX 文本错误: {}", err)))?;
                        if table_depth > 0 {
                            cell.push_str(&decoded);
                        } else {
                            paragraph.push_str(&decoded);
                        }
                    }
                }
                Event::GeneralRef(r) => {
                    if in_text {
                        let resolved = resolve_entity_ref(&r)?;
                        if table_depth > 0 {
                            cell.push_str(&resolved);
                        } else {
                            paragraph.push_str(&resolved);
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(content)
    }
}

impl FormatParser for WordParser {
    fn format(&self) -> FileFormat {
        FileFormat::Word
    }

    fn parse(&self, bytes: &[u8], options: &ParseOptions) -> ImportResult<ParsedTable> {
        let xml = Self::read_document_xml(bytes)?;
        let content = Self::parse_document_xml(&xml)?;

        // 取第一个含表头 + 数据行的表格
        if let Some(table) = content.tables.iter().find(|t| t.len() >= 2) {
            debug!(rows = table.len(), "DOCX 表格提取");
            let mut builder = TableBuilder::new(FileFormat::Word, options);
            builder.set_headers(table[0].clone());
            for row in &table[1..] {
                builder.push_row(row.clone())?;
            }
            return builder.finish();
        }

        let text = content.paragraphs.join("\n");
        extract_table(&text, FileFormat::Word, options)
    }
}

// ==========================================
// Email Parser 实现
// ==========================================
pub struct EmailParser {
    attachment_parsers: Vec<Arc<dyn FormatParser>>,
}

impl EmailParser {
    pub fn new(attachment_parsers: Vec<Arc<dyn FormatParser>>) -> Self {
        Self { attachment_parsers }
    }

    /// 附件支持全部结构化格式
    pub fn with_default_attachment_parsers() -> Self {
        Self::new(vec![
            Arc::new(CsvParser),
            Arc::new(ExcelParser),
            Arc::new(JsonParser),
            Arc::new(XmlParser),
        ])
    }

    fn parser_for(&self, format: FileFormat) -> Option<&Arc<dyn FormatParser>> {
        self.attachment_parsers.iter().find(|p| p.format() == format)
    }
}

impl FormatParser for EmailParser {
    fn format(&self) -> FileFormat {
        FileFormat::Email
    }

    fn parse(&self, bytes: &[u8], options: &ParseOptions) -> ImportResult<ParsedTable> {
        let message = MessageParser::default()
            .parse(bytes)
            .ok_or_else(|| ImportError::ParseError("邮件解析失败".to_string()))?;

        for part in message.attachments() {
            let name = part.attachment_name().unwrap_or("").to_string();
            let mime = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_default();

            let Ok(format) = detect_format(&name, &mime) else {
                debug!(attachment = %name, mime = %mime, "跳过不支持的附件");
                continue;
            };
            if let Some(parser) = self.parser_for(format) {
                info!(attachment = %name, format = %format, "解析邮件附件");
                let mut table = parser.parse(part.contents(), options)?;
                table.format = FileFormat::Email;
                return Ok(table);
            }
        }

        let body = message
            .body_text(0)
            .map(|b| b.to_string())
            .unwrap_or_default();
        if body.trim().is_empty() {
            return Err(ImportError::ParseError(
                "邮件既无可解析附件也无正文".to_string(),
            ));
        }
        extract_table(&body, FileFormat::Email, options)
    }
}
