//! ISO 639 language lookup used to canonicalize language entries to two-letter codes.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// (ISO 639-1, ISO 639-2/T, ISO 639-2/B, English name)
const LANGUAGES: &[(&str, &str, &str, &str)] = &[
    ("af", "afr", "afr", "Afrikaans"),
    ("ar", "ara", "ara", "Arabic"),
    ("az", "aze", "aze", "Azerbaijani"),
    ("be", "bel", "bel", "Belarusian"),
    ("bg", "bul", "bul", "Bulgarian"),
    ("bn", "ben", "ben", "Bengali"),
    ("bs", "bos", "bos", "Bosnian"),
    ("ca", "cat", "cat", "Catalan"),
    ("cs", "ces", "cze", "Czech"),
    ("cy", "cym", "wel", "Welsh"),
    ("da", "dan", "dan", "Danish"),
    ("de", "deu", "ger", "German"),
    ("el", "ell", "gre", "Greek"),
    ("en", "eng", "eng", "English"),
    ("eo", "epo", "epo", "Esperanto"),
    ("es", "spa", "spa", "Spanish"),
    ("et", "est", "est", "Estonian"),
    ("eu", "eus", "baq", "Basque"),
    ("fa", "fas", "per", "Persian"),
    ("fi", "fin", "fin", "Finnish"),
    ("fr", "fra", "fre", "French"),
    ("ga", "gle", "gle", "Irish"),
    ("gl", "glg", "glg", "Galician"),
    ("gu", "guj", "guj", "Gujarati"),
    ("he", "heb", "heb", "Hebrew"),
    ("hi", "hin", "hin", "Hindi"),
    ("hr", "hrv", "hrv", "Croatian"),
    ("hu", "hun", "hun", "Hungarian"),
    ("hy", "hye", "arm", "Armenian"),
    ("id", "ind", "ind", "Indonesian"),
    ("is", "isl", "ice", "Icelandic"),
    ("it", "ita", "ita", "Italian"),
    ("ja", "jpn", "jpn", "Japanese"),
    ("ka", "kat", "geo", "Georgian"),
    ("kk", "kaz", "kaz", "Kazakh"),
    ("km", "khm", "khm", "Khmer"),
    ("kn", "kan", "kan", "Kannada"),
    ("ko", "kor", "kor", "Korean"),
    ("lt", "lit", "lit", "Lithuanian"),
    ("lv", "lav", "lav", "Latvian"),
    ("mk", "mkd", "mac", "Macedonian"),
    ("ml", "mal", "mal", "Malayalam"),
    ("mn", "mon", "mon", "Mongolian"),
    ("mr", "mar", "mar", "Marathi"),
    ("ms", "msa", "may", "Malay"),
    ("my", "mya", "bur", "Burmese"),
    ("ne", "nep", "nep", "Nepali"),
    ("nl", "nld", "dut", "Dutch"),
    ("no", "nor", "nor", "Norwegian"),
    ("pa", "pan", "pan", "Punjabi"),
    ("pl", "pol", "pol", "Polish"),
    ("pt", "por", "por", "Portuguese"),
    ("ro", "ron", "rum", "Romanian"),
    ("ru", "rus", "rus", "Russian"),
    ("si", "sin", "sin", "Sinhala"),
    ("sk", "slk", "slo", "Slovak"),
    ("sl", "slv", "slv", "Slovenian"),
    ("sq", "sqi", "alb", "Albanian"),
    ("sr", "srp", "srp", "Serbian"),
    ("sv", "swe", "swe", "Swedish"),
    ("sw", "swa", "swa", "Swahili"),
    ("ta", "tam", "tam", "Tamil"),
    ("te", "tel", "tel", "Telugu"),
    ("th", "tha", "tha", "Thai"),
    ("tl", "tgl", "tgl", "Tagalog"),
    ("tr", "tur", "tur", "Turkish"),
    ("uk", "ukr", "ukr", "Ukrainian"),
    ("ur", "urd", "urd", "Urdu"),
    ("uz", "uzb", "uzb", "Uzbek"),
    ("vi", "vie", "vie", "Vietnamese"),
    ("zh", "zho", "chi", "Chinese"),
    ("zu", "zul", "zul", "Zulu"),
];

// Every alias (lower-cased) mapped to its index in LANGUAGES
static ALIASES: Lazy<HashMap<String, usize>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for (idx, (alpha2, alpha3_t, alpha3_b, name)) in LANGUAGES.iter().enumerate() {
        map.insert(alpha2.to_string(), idx);
        map.insert(alpha3_t.to_string(), idx);
        map.insert(alpha3_b.to_string(), idx);
        map.insert(name.to_lowercase(), idx);
    }
    map
});

/// Resolves a two-letter code, three-letter code or English name to the
/// two-letter code. Unknown entries come back lower-cased for manual review.
pub fn resolve(entry: &str) -> String {
    let key = entry.trim().to_lowercase();
    match ALIASES.get(&key) {
        Some(&idx) => LANGUAGES[idx].0.to_string(),
        None => key,
    }
}

/// English display name for a canonical code.
pub fn display_name(code: &str) -> Option<&'static str> {
    LANGUAGES
        .iter()
        .find(|(alpha2, ..)| *alpha2 == code)
        .map(|(.., name)| *name)
}
