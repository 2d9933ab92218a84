//! Mapping of raw brand names to the folder names used on the image origin.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The aliases every portal surface knew about.
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("blomus", "blomus"),
    ("elvang", "elvang"),
    ("gefu", "gefu"),
    ("räder", "rader"),
    ("rader", "rader"),
    ("myflame", "myflame"),
    ("my flame", "myflame"),
    ("my-flame", "myflame"),
    ("my-flame-lifestyle", "myflame"),
    ("my flame lifestyle", "myflame"),
    ("relaxound", "relaxound"),
    ("remember", "remember"),
];

/// The folder token a brand's images are stored under.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalBrand(String);

impl CanonicalBrand {
    /// Returns the folder token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CanonicalBrand {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalBrand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lookup table from normalized brand spellings to their canonical folder.
///
/// Lookups are case-insensitive and treat accented letters like their ASCII
/// base letter, so `"Räder"`, `"RADER"` and `"räder"` all end up in `rader`.
/// Brands that are not in the table fall back to a lower-cased slug of the raw
/// name. The slug keeps its accents: `"Maison Dör"` lives in `maison-dör`.
#[derive(Clone, Debug)]
pub struct BrandAliases {
    aliases: BTreeMap<String, CanonicalBrand>,
}

impl Default for BrandAliases {
    fn default() -> Self {
        Self::with_extra(std::iter::empty::<(&str, &str)>())
    }
}

impl BrandAliases {
    /// Creates the builtin table, extended by `extra` aliases.
    ///
    /// Extra aliases win over builtin ones with the same normalized spelling.
    pub fn with_extra<I, K, V>(extra: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut aliases = BTreeMap::new();
        let builtin = BUILTIN_ALIASES.iter().map(|(k, v)| (*k, *v));
        for (alias, folder) in builtin {
            aliases.insert(normalize(alias), CanonicalBrand(folder.to_owned()));
        }
        for (alias, folder) in extra {
            let folder = slugify(folder.as_ref());
            if folder.is_empty() {
                continue;
            }
            aliases.insert(normalize(alias.as_ref()), CanonicalBrand(folder));
        }
        Self { aliases }
    }

    /// Resolves a raw brand to its canonical folder.
    ///
    /// Returns `None` if the brand is empty or consists only of whitespace.
    pub fn canonicalize(&self, raw: &str) -> Option<CanonicalBrand> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return None;
        }
        if let Some(canonical) = self.aliases.get(&normalized) {
            return Some(canonical.clone());
        }
        Some(CanonicalBrand(slugify(raw)))
    }
}

/// Lower-cases, folds diacritics and collapses whitespace runs to a single space.
///
/// Only used for alias lookups, never for folder names.
fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for word in raw.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        for c in word.chars().flat_map(char::to_lowercase) {
            match fold_diacritic(c) {
                Some(folded) => out.push_str(folded),
                None => out.push(c),
            }
        }
    }
    out
}

/// Lower-cases and joins the words of `raw` with `-`, keeping every other character.
fn slugify(raw: &str) -> String {
    let words: Vec<_> = raw.split_whitespace().map(str::to_lowercase).collect();
    words.join("-")
}

/// ASCII replacement for lower-case latin letters with diacritics.
fn fold_diacritic(c: char) -> Option<&'static str> {
    let folded = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'æ' => "ae",
        'ç' | 'ć' | 'č' => "c",
        'ď' | 'đ' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' => "i",
        'ł' => "l",
        'ñ' | 'ń' | 'ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'œ' => "oe",
        'ř' => "r",
        'ś' | 'š' | 'ş' => "s",
        'ß' => "ss",
        'ť' | 'ţ' => "t",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => "u",
        'ý' | 'ÿ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        _ => return None,
    };
    Some(folded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(raw: &str) -> Option<String> {
        BrandAliases::default()
            .canonicalize(raw)
            .map(|b| b.as_str().to_owned())
    }

    #[test]
    fn test_builtin_aliases() {
        assert_eq!(canonical("blomus").as_deref(), Some("blomus"));
        assert_eq!(canonical("My Flame").as_deref(), Some("myflame"));
        assert_eq!(canonical("my-flame-lifestyle").as_deref(), Some("myflame"));
        assert_eq!(canonical("Relaxound").as_deref(), Some("relaxound"));
    }

    #[test]
    fn test_diacritics_and_case() {
        assert_eq!(canonical("räder").as_deref(), Some("rader"));
        assert_eq!(canonical("RÄDER").as_deref(), Some("rader"));
        assert_eq!(canonical("RADER").as_deref(), Some("rader"));
        assert_eq!(canonical("  Räder  ").as_deref(), Some("rader"));
    }

    #[test]
    fn test_unknown_brand_slug() {
        assert_eq!(canonical("Some   New Brand").as_deref(), Some("some-new-brand"));
        assert_eq!(canonical("Ørsted Home").as_deref(), Some("ørsted-home"));
        assert_eq!(canonical("Maison Dör").as_deref(), Some("maison-dör"));
        assert_eq!(canonical(" MAISON\tDÖR ").as_deref(), Some("maison-dör"));
    }

    #[test]
    fn test_empty_brand() {
        assert_eq!(canonical(""), None);
        assert_eq!(canonical(" \t "), None);
    }

    #[test]
    fn test_extra_aliases_override() {
        let aliases = BrandAliases::with_extra([("Gefu", "Gefu Kitchen"), ("ppd", "paperproducts")]);
        assert_eq!(aliases.canonicalize("gefu").unwrap().as_str(), "gefu-kitchen");
        assert_eq!(aliases.canonicalize("PPD").unwrap().as_str(), "paperproducts");
        // Builtin aliases that were not overridden still apply.
        assert_eq!(aliases.canonicalize("RÄDER").unwrap().as_str(), "rader");
    }
}
