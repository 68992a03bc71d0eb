//! Metadata-extraction collaborator.
//!
//! Best-effort guesses of ticker, company, date, broker and so on from the
//! first lines of a parsed report, falling back to the file name convention
//! `{broker}_{company}_{YYYYMMDD}.pdf`. Extraction never fails; fields that
//! cannot be found get fixed defaults.

use std::path::Path;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

use crate::models::{FieldMap, ReportMetadata};

/// Only the head of a report carries cover-page fields.
const PREVIEW_LINES: usize = 200;

pub const UNKNOWN: &str = "UNKNOWN";
pub const DEFAULT_DATE: &str = "1970-01-01";
pub const DEFAULT_REPORT_TYPE: &str = "기타";

const BROKER_NAME_MAP: &[(&str, &str)] = &[
    ("mirae", "미래에셋증권"),
    ("koreainvest", "한국투자증권"),
    ("samsung", "삼성증권"),
    ("nh", "NH투자증권"),
    ("kb", "KB증권"),
    ("shinhan", "신한투자증권"),
    ("hana", "하나증권"),
    ("kiwoom", "키움증권"),
];

/// Broker names recognised in the report body, in priority order.
const BROKER_NAMES: &[&str] = &[
    "미래에셋증권",
    "한국투자증권",
    "삼성증권",
    "NH투자증권",
    "KB증권",
    "신한투자증권",
];

const RATING_KEYWORDS: &[(&str, &[&str])] = &[
    ("매수", &["매수", "buy", "overweight", "비중확대"]),
    ("중립", &["중립", "hold", "neutral", "시장수익률"]),
    ("매도", &["매도", "sell", "underweight", "비중축소"]),
];

const REPORT_TYPE_KEYWORDS: &[(&[&str], &str)] = &[
    (&["실적", "분기", "컨센서스"], "실적분석"),
    (&["기업", "밸류에이션", "목표주가"], "기업분석"),
    (&["업종", "섹터", "산업"], "업종분석"),
];

pub trait MetadataExtractor: Send + Sync {
    /// Flat field map for a parsed document. Never fails.
    fn extract(&self, text: &str, filename: &str) -> FieldMap;
}

/// Regex heuristics for Korean sell-side analyst reports.
#[derive(Debug, Default, Clone)]
pub struct ReportMetadataExtractor;

impl MetadataExtractor for ReportMetadataExtractor {
    fn extract(&self, text: &str, filename: &str) -> FieldMap {
        self.extract_report(text, filename).to_fields()
    }
}

struct Patterns {
    ticker: Vec<Regex>,
    ticker_in_name: Regex,
    company: Vec<Regex>,
    date: Vec<Regex>,
    date_in_name: Regex,
    analyst: Vec<Regex>,
    target_price: Vec<Regex>,
    rating: Regex,
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid metadata regex")
}

fn compile_ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("valid metadata regex")
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        ticker: vec![
            compile(r"\b(\d{6})\b"),
            compile(r"\((\d{6})\)"),
            compile(r"종목코드[:\s]*(\d{6})"),
        ],
        ticker_in_name: compile(r"(?:^|[^0-9])(\d{6})(?:[^0-9]|$)"),
        company: vec![
            compile(r"(?m)기업명[:\s]*([가-힣A-Za-z0-9(). ]+)"),
            compile(r"(?m)종목명[:\s]*([가-힣A-Za-z0-9(). ]+)"),
            compile(r"(?m)^#\s*([가-힣A-Za-z0-9(). ]+)"),
        ],
        date: vec![
            compile(r"(\d{4})[./-](\d{1,2})[./-](\d{1,2})"),
            compile(r"(\d{4})년\s*(\d{1,2})월\s*(\d{1,2})일"),
        ],
        date_in_name: compile(r"(20\d{2})(\d{2})(\d{2})"),
        analyst: vec![
            compile(r"애널리스트[:\s]*([가-힣]{2,4})"),
            compile(r"Analyst[:\s]*([A-Za-z .-]{2,40})"),
        ],
        target_price: vec![
            compile_ci(r"목표주?가[:\s]*([0-9,]+)\s*원"),
            compile_ci(r"Target\s*Price[:\s]*([0-9,]+)"),
            compile_ci(r"TP[:\s]*([0-9,]+)\s*원"),
        ],
        rating: compile_ci(r"(?:투자의견|투자등급|rating|recommendation)[:\s]*([^\n]+)"),
    })
}

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    patterns.iter().find_map(|re| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

fn stem_parts(source_file: &str) -> Vec<String> {
    Path::new(source_file)
        .file_stem()
        .map(|s| s.to_string_lossy().split('_').map(String::from).collect())
        .unwrap_or_default()
}

impl ReportMetadataExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Typed form of [`MetadataExtractor::extract`].
    pub fn extract_report(&self, text: &str, filename: &str) -> ReportMetadata {
        let preview = text.lines().take(PREVIEW_LINES).collect::<Vec<_>>().join("\n");
        let source_file = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.to_string());

        ReportMetadata {
            ticker: ticker(&preview)
                .or_else(|| ticker_from_filename(&source_file))
                .unwrap_or_else(|| UNKNOWN.to_string()),
            company_name: first_capture(&patterns().company, &preview)
                .or_else(|| company_from_filename(&source_file))
                .unwrap_or_else(|| UNKNOWN.to_string()),
            date: date(&preview)
                .or_else(|| date_from_filename(&source_file))
                .unwrap_or_else(|| DEFAULT_DATE.to_string()),
            broker: broker(&preview)
                .or_else(|| broker_from_filename(&source_file))
                .unwrap_or_else(|| UNKNOWN.to_string()),
            analyst: first_capture(&patterns().analyst, &preview),
            report_type: report_type(&preview),
            target_price: target_price(&preview),
            rating: rating(&preview),
            source_file,
        }
    }
}

fn ticker(text: &str) -> Option<String> {
    first_capture(&patterns().ticker, text)
}

fn ticker_from_filename(name: &str) -> Option<String> {
    patterns()
        .ticker_in_name
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `{broker}_{company}_{date}`: the second part, dashes read as spaces.
fn company_from_filename(name: &str) -> Option<String> {
    let parts = stem_parts(name);
    if parts.len() >= 3 {
        Some(parts[1].replace('-', " "))
    } else {
        None
    }
}

fn date(text: &str) -> Option<String> {
    patterns().date.iter().find_map(|re| {
        let caps = re.captures(text)?;
        let year: u32 = caps.get(1)?.as_str().parse().ok()?;
        let month: u32 = caps.get(2)?.as_str().parse().ok()?;
        let day: u32 = caps.get(3)?.as_str().parse().ok()?;
        Some(format!("{:04}-{:02}-{:02}", year, month, day))
    })
}

fn date_from_filename(name: &str) -> Option<String> {
    let caps = patterns().date_in_name.captures(name)?;
    Some(format!("{}-{}-{}", &caps[1], &caps[2], &caps[3]))
}

fn broker(text: &str) -> Option<String> {
    BROKER_NAMES
        .iter()
        .find(|name| text.contains(*name))
        .map(|name| name.to_string())
}

fn broker_from_filename(name: &str) -> Option<String> {
    let key = stem_parts(name).first()?.to_lowercase();
    BROKER_NAME_MAP
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
}

fn target_price(text: &str) -> Option<u64> {
    patterns().target_price.iter().find_map(|re| {
        let caps = re.captures(text)?;
        caps.get(1)?.as_str().replace(',', "").parse().ok()
    })
}

fn rating(text: &str) -> Option<String> {
    let caps = patterns().rating.captures(text)?;
    let value = caps.get(1)?.as_str().trim().to_lowercase();
    RATING_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| value.contains(k)))
        .map(|(rating, _)| rating.to_string())
}

fn report_type(text: &str) -> String {
    let lowered = text.to_lowercase();
    REPORT_TYPE_KEYWORDS
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lowered.contains(&k.to_lowercase())))
        .map(|(_, kind)| kind.to_string())
        .unwrap_or_else(|| DEFAULT_REPORT_TYPE.to_string())
}
