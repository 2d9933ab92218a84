use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::brand::CanonicalBrand;

/// Identifies one base product image on the origin.
///
/// Size variants are not part of the key: all variants of a product image are
/// derived from the same base image and share one cache entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageKey {
    brand: CanonicalBrand,
    sku: Arc<str>,
}

impl ImageKey {
    /// Creates a new key. The SKU is trimmed but otherwise kept verbatim.
    pub fn new(brand: CanonicalBrand, sku: &str) -> Self {
        Self {
            brand,
            sku: sku.trim().into(),
        }
    }

    /// The canonical brand folder.
    pub fn brand(&self) -> &CanonicalBrand {
        &self.brand
    }

    /// The product SKU.
    pub fn sku(&self) -> &str {
        &self.sku
    }

    /// Renders a file name pattern, replacing `{sku}` with the SKU.
    pub fn file_name(&self, pattern: &str) -> String {
        pattern.replace("{sku}", &self.sku)
    }

    /// Builds the URL of one image file below the given `origin`.
    ///
    /// The layout is `{origin}/brand-images/{brand}/{file}`. Path segments are
    /// percent-encoded, so odd SKUs can't escape their brand folder.
    pub fn image_url(&self, origin: &Url, file_name: &str) -> Url {
        let mut url = origin.clone();
        url.set_query(None);
        url.set_fragment(None);
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("brand-images")
                .push(self.brand.as_str())
                .push(file_name);
        }
        url
    }

    /// The URLs the image may live at, in the order of `patterns`.
    pub fn candidate_urls<'a, I>(&self, origin: &Url, patterns: I) -> Vec<Url>
    where
        I: IntoIterator<Item = &'a String>,
    {
        patterns
            .into_iter()
            .map(|pattern| self.image_url(origin, &self.file_name(pattern)))
            .collect()
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.brand, self.sku)
    }
}

#[cfg(test)]
mod tests {
    use crate::brand::BrandAliases;

    use super::*;

    fn key(brand: &str, sku: &str) -> ImageKey {
        ImageKey::new(BrandAliases::default().canonicalize(brand).unwrap(), sku)
    }

    fn primary_url(key: &ImageKey, origin: &Url) -> String {
        key.image_url(origin, &key.file_name("{sku}_1.webp")).into()
    }

    #[test]
    fn test_image_url() {
        let origin: Url = "https://ik.imagekit.io/a7kelms9a".parse().unwrap();
        assert_eq!(
            primary_url(&key("Blomus", "BL12345"), &origin),
            "https://ik.imagekit.io/a7kelms9a/brand-images/blomus/BL12345_1.webp"
        );

        let origin: Url = "https://ik.imagekit.io/a7kelms9a/?v=2".parse().unwrap();
        assert_eq!(
            primary_url(&key("räder", " R1 "), &origin),
            "https://ik.imagekit.io/a7kelms9a/brand-images/rader/R1_1.webp"
        );
    }

    #[test]
    fn test_sku_is_encoded() {
        let origin: Url = "http://localhost:1234".parse().unwrap();
        assert_eq!(
            primary_url(&key("gefu", "../x y"), &origin),
            "http://localhost:1234/brand-images/gefu/..%2Fx%20y_1.webp"
        );
    }

    #[test]
    fn test_candidate_urls() {
        let origin: Url = "http://localhost:1234/images".parse().unwrap();
        let patterns = ["{sku}_1.webp", "{sku}.webp", "{sku}.jpg"].map(String::from);
        let urls: Vec<String> = key("Maison Dör", "MD-1")
            .candidate_urls(&origin, &patterns)
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            urls,
            [
                "http://localhost:1234/images/brand-images/maison-d%C3%B6r/MD-1_1.webp",
                "http://localhost:1234/images/brand-images/maison-d%C3%B6r/MD-1.webp",
                "http://localhost:1234/images/brand-images/maison-d%C3%B6r/MD-1.jpg",
            ]
        );
    }

    #[test]
    fn test_same_canonical_brand_same_key() {
        assert_eq!(key("räder", "R1"), key("RADER", "R1"));
        assert_ne!(key("rader", "R1"), key("rader", "r1"));
    }

    #[test]
    fn test_key_debug() {
        insta::assert_debug_snapshot!(key("My Flame", "MF-01"), @r###"
        ImageKey {
            brand: CanonicalBrand(
                "myflame",
            ),
            sku: "MF-01",
        }
        "###);
    }
}
