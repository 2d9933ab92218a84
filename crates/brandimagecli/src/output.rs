use brandimage_service::brand::CanonicalBrand;
use brandimage_service::{Resolution, ResolutionReport};
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Table, row};
use serde::Serialize;

/// One resolved SKU, as printed by `--format json`.
#[derive(Debug, Serialize)]
struct SkuReport<'a> {
    sku: &'a str,
    #[serde(flatten)]
    report: ResolutionReport,
}

/// Renders the resolutions of `skus` as a JSON array, in input order.
pub fn resolutions_json(skus: &[String], resolutions: &[Resolution]) -> serde_json::Result<String> {
    let reports: Vec<_> = skus
        .iter()
        .zip(resolutions)
        .map(|(sku, resolution)| SkuReport {
            sku,
            report: resolution.into(),
        })
        .collect();
    serde_json::to_string_pretty(&reports)
}

/// Renders the resolutions of `skus` as a table with one row per SKU.
pub fn resolutions_table(skus: &[String], resolutions: &[Resolution]) -> Table {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row!["SKU", "Status", "URL"]);

    for (sku, resolution) in skus.iter().zip(resolutions) {
        match resolution {
            Ok(image) => table.add_row(row![sku, "ok", image.url]),
            Err(err) => table.add_row(row![sku, err.reason(), err]),
        };
    }

    table
}

/// Renders how each raw brand maps to its image folder.
pub fn brands_table(brands: &[(String, Option<CanonicalBrand>)]) -> Table {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row!["Brand", "Folder"]);

    for (raw, canonical) in brands {
        match canonical {
            Some(canonical) => table.add_row(row![raw, canonical]),
            None => table.add_row(row![raw, "-"]),
        };
    }

    table
}
