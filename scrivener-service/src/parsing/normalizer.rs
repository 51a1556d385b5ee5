//! Normalizes raw analysis output into ordered sections.
//!
//! Paragraphs and tables become one flat `Vec<Section>` sorted by
//! `(page_number, offset)`, which is the reading order downstream chunking
//! relies on. Tables are rendered to HTML so their structure survives as text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::analysis::{AnalyzedTable, RawAnalysis};

/// What kind of layout element a section came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Paragraph,
    Table,
}

/// One unit of document content in reading order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub content: String,
    #[serde(rename = "type")]
    pub kind: SectionKind,
    /// Flattened bounding polygon on the page
    #[serde(default)]
    pub viewport: Vec<f64>,
    pub offset: u64,
    pub page_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_count: Option<u32>,
}

/// Page geometry keyed by page number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageInfo {
    pub width: f64,
    pub height: f64,
    pub unit: String,
    pub angle: f64,
}

/// Flatten a raw analysis into sorted sections plus per-page geometry.
pub fn extract(raw: &RawAnalysis) -> (Vec<Section>, BTreeMap<String, PageInfo>) {
    let mut sections = Vec::with_capacity(raw.paragraphs.len() + raw.tables.len());

    for paragraph in &raw.paragraphs {
        let region = paragraph.bounding_regions.first();
        sections.push(Section {
            content: paragraph.content.clone(),
            kind: SectionKind::Paragraph,
            viewport: region.map(|r| r.polygon.clone()).unwrap_or_default(),
            offset: paragraph.spans.first().map(|s| s.offset).unwrap_or(0),
            page_number: region.map(|r| r.page_number).unwrap_or(1),
            role: paragraph.role.clone(),
            row_count: None,
            column_count: None,
        });
    }

    for table in &raw.tables {
        let region = table.bounding_regions.first();
        sections.push(Section {
            content: table_to_html(table),
            kind: SectionKind::Table,
            viewport: region.map(|r| r.polygon.clone()).unwrap_or_default(),
            offset: table.spans.first().map(|s| s.offset).unwrap_or(0),
            page_number: region.map(|r| r.page_number).unwrap_or(1),
            role: None,
            row_count: Some(table.row_count),
            column_count: Some(table.column_count),
        });
    }

    sections.sort_by_key(|s| (s.page_number, s.offset));

    let page_info = raw
        .pages
        .iter()
        .map(|p| {
            (
                p.page_number.to_string(),
                PageInfo {
                    width: p.width,
                    height: p.height,
                    unit: p.unit.clone(),
                    angle: p.angle,
                },
            )
        })
        .collect();

    (sections, page_info)
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Render a table to HTML, preserving header cells and spans.
pub fn table_to_html(table: &AnalyzedTable) -> String {
    let mut rows: Vec<Vec<String>> = vec![Vec::new(); table.row_count as usize];

    let mut cells: Vec<_> = table.cells.iter().collect();
    cells.sort_by_key(|c| (c.row_index, c.column_index));

    for cell in cells {
        let Some(row) = rows.get_mut(cell.row_index as usize) else {
            continue;
        };

        let tag = if cell.kind.as_deref() == Some("columnHeader") {
            "th"
        } else {
            "td"
        };

        let mut attrs = String::new();
        if let Some(span) = cell.column_span.filter(|s| *s > 1) {
            attrs.push_str(&format!(" colspan=\"{span}\""));
        }
        if let Some(span) = cell.row_span.filter(|s| *s > 1) {
            attrs.push_str(&format!(" rowspan=\"{span}\""));
        }

        row.push(format!(
            "<{tag}{attrs}>{}</{tag}>",
            escape_html(&cell.content)
        ));
    }

    let body: String = rows
        .into_iter()
        .map(|cells| format!("<tr>{}</tr>", cells.join("")))
        .collect();

    format!("<table>{body}</table>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{
        AnalyzedPage, AnalyzedParagraph, AnalyzedSpan, AnalyzedTableCell, BoundingRegion,
    };

    fn paragraph(content: &str, page: u32, offset: u64) -> AnalyzedParagraph {
        AnalyzedParagraph {
            content: content.to_string(),
            role: None,
            bounding_regions: vec![BoundingRegion {
                page_number: page,
                polygon: vec![0.0; 8],
            }],
            spans: vec![AnalyzedSpan { offset, length: 10 }],
        }
    }

    fn cell(row: u32, column: u32, content: &str) -> AnalyzedTableCell {
        AnalyzedTableCell {
            row_index: row,
            column_index: column,
            content: content.to_string(),
            kind: None,
            row_span: None,
            column_span: None,
        }
    }

    #[test]
    fn sections_sort_by_page_then_offset() {
        let raw = RawAnalysis {
            pages: vec![],
            paragraphs: vec![
                paragraph("second page", 2, 5),
                paragraph("first page late", 1, 90),
                paragraph("first page early", 1, 10),
            ],
            tables: vec![],
        };

        let (sections, _) = extract(&raw);
        let contents: Vec<&str> = sections.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["first page early", "first page late", "second page"]
        );
    }

    #[test]
    fn tables_interleave_with_paragraphs_by_offset() {
        let raw = RawAnalysis {
            pages: vec![],
            paragraphs: vec![paragraph("intro", 1, 0), paragraph("outro", 1, 200)],
            tables: vec![AnalyzedTable {
                row_count: 1,
                column_count: 1,
                cells: vec![cell(0, 0, "42")],
                bounding_regions: vec![BoundingRegion {
                    page_number: 1,
                    polygon: vec![],
                }],
                spans: vec![AnalyzedSpan {
                    offset: 100,
                    length: 2,
                }],
            }],
        };

        let (sections, _) = extract(&raw);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[1].kind, SectionKind::Table);
        assert_eq!(sections[1].row_count, Some(1));
    }

    #[test]
    fn page_info_is_keyed_by_page_number() {
        let raw = RawAnalysis {
            pages: vec![AnalyzedPage {
                page_number: 1,
                width: 8.5,
                height: 11.0,
                unit: "inch".to_string(),
                angle: 0.0,
            }],
            paragraphs: vec![],
            tables: vec![],
        };

        let (_, page_info) = extract(&raw);
        assert_eq!(page_info["1"].unit, "inch");
    }

    #[test]
    fn table_html_uses_th_for_column_headers() {
        let table = AnalyzedTable {
            row_count: 2,
            column_count: 2,
            cells: vec![
                AnalyzedTableCell {
                    kind: Some("columnHeader".to_string()),
                    ..cell(0, 0, "Name")
                },
                AnalyzedTableCell {
                    kind: Some("columnHeader".to_string()),
                    ..cell(0, 1, "Total")
                },
                cell(1, 0, "Widgets"),
                cell(1, 1, "12"),
            ],
            bounding_regions: vec![],
            spans: vec![],
        };

        let html = table_to_html(&table);
        assert_eq!(
            html,
            "<table><tr><th>Name</th><th>Total</th></tr>\
             <tr><td>Widgets</td><td>12</td></tr></table>"
        );
    }

    #[test]
    fn table_html_renders_spans_and_escapes_content() {
        let table = AnalyzedTable {
            row_count: 1,
            column_count: 2,
            cells: vec![AnalyzedTableCell {
                column_span: Some(2),
                ..cell(0, 0, "a < b & c")
            }],
            bounding_regions: vec![],
            spans: vec![],
        };

        let html = table_to_html(&table);
        assert_eq!(
            html,
            "<table><tr><td colspan=\"2\">a &lt; b &amp; c</td></tr></table>"
        );
    }
}
