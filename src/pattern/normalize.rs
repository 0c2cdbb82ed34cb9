//! Question text normalization
//!
//! Questions and triggers are compared after the same folding, so that
//! `الأكثر مبيعاً`, `الاكثر مبيعا` and `الأكثر مبيعًا` are the same phrase.

/// Fold a question or trigger phrase for containment matching
///
/// Lowercases, strips Arabic diacritics and tatweel, unifies alef forms,
/// alef maqsura and ta marbuta, maps Arabic-Indic digits to ASCII, folds
/// common Latin accents and collapses whitespace.
#[must_use]
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;

    for c in text.chars().flat_map(char::to_lowercase) {
        let mapped = match c {
            // Harakat, superscript alef, tatweel
            '\u{064B}'..='\u{065F}' | '\u{0670}' | '\u{0640}' => continue,
            'أ' | 'إ' | 'آ' | 'ٱ' => 'ا',
            'ى' => 'ي',
            'ة' => 'ه',
            '\u{0660}'..='\u{0669}' => char::from_digit(c as u32 - 0x0660, 10).unwrap_or(c),
            '\u{06F0}'..='\u{06F9}' => char::from_digit(c as u32 - 0x06F0, 10).unwrap_or(c),
            c => fold_latin(c),
        };

        if mapped.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(mapped);
    }

    out
}

fn fold_latin(c: char) -> char {
    match c {
        'à'..='å' => 'a',
        'ç' => 'c',
        'è'..='ë' => 'e',
        'ì'..='ï' => 'i',
        'ñ' => 'n',
        'ò'..='ö' => 'o',
        'ù'..='ü' => 'u',
        'ý' | 'ÿ' => 'y',
        c => c,
    }
}
