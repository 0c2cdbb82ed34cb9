//! Caller-facing language handling
//!
//! Askql answers in the language the question was asked in. A caller may pass
//! an explicit hint; otherwise any Arabic-script character selects Arabic.

use serde::{Deserialize, Serialize};

/// Language used for summaries and error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Arabic (the deployment's business language)
    #[default]
    Ar,
    /// English
    En,
}

impl Language {
    /// Detect the language of free text
    #[must_use]
    pub fn detect(text: &str) -> Self {
        if text.chars().any(is_arabic) {
            Self::Ar
        } else {
            Self::En
        }
    }

    /// Use the hint when present, otherwise detect from the text
    #[must_use]
    pub fn resolve(hint: Option<Self>, text: &str) -> Self {
        hint.unwrap_or_else(|| Self::detect(text))
    }

    /// Parse a language code (`ar`, `en`)
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "ar" | "arabic" => Some(Self::Ar),
            "en" | "english" => Some(Self::En),
            _ => None,
        }
    }
}

/// Arabic, Arabic Supplement and Arabic Presentation Forms blocks
pub(crate) fn is_arabic(c: char) -> bool {
    matches!(c, '\u{0600}'..='\u{06FF}' | '\u{0750}'..='\u{077F}' | '\u{FB50}'..='\u{FDFF}' | '\u{FE70}'..='\u{FEFF}')
}

/// Number of columns listed in a summary before eliding the rest
const SUMMARY_COLUMNS: usize = 6;

/// Render the fixed summary template for a result shape
///
/// Never fails: an absent result renders as zero rows and no columns.
#[must_use]
pub fn render_summary(lang: Language, row_count: usize, columns: &[String]) -> String {
    let mut listed = columns.iter().take(SUMMARY_COLUMNS).map(String::as_str).collect::<Vec<_>>().join(", ");
    if columns.len() > SUMMARY_COLUMNS {
        listed.push_str("...");
    }

    match lang {
        Language::Ar => format!("عدد الصفوف المعروضة: {row_count} | الأعمدة: {listed}"),
        Language::En => format!("Rows: {row_count} | columns: {listed}"),
    }
}
