use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::model::ItemDescriptor;

/// Read `name, standard_id, premium_id` rows from a CSV file.
pub fn load(path: &Path) -> Result<Vec<ItemDescriptor>> {
    let file = File::open(path).with_context(|| format!("Failed to open catalog {:?}", path))?;
    let items = load_from_reader(file);
    info!("Loaded {} items from {:?}", items.len(), path);
    Ok(items)
}

/// Rows with fewer than three fields, or that fail to decode, are skipped.
pub fn load_from_reader<R: Read>(reader: R) -> Vec<ItemDescriptor> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut items = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                debug!("Skipping unreadable catalog row {}: {}", line + 1, e);
                continue;
            }
        };
        if record.len() < 3 {
            debug!("Skipping catalog row {} with {} fields", line + 1, record.len());
            continue;
        }
        let name = record[0].trim_start_matches('\u{feff}');
        items.push(ItemDescriptor::new(name, &record[1], &record[2]));
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn trims_and_skips_short_rows() {
        let input = "爪子刀（★） | 人工染色 (崭新出厂), 57387, 60612\n\
                     only,two\n\
                     \n\
                     single\n  AK-47 | 红线 ,  1234 ,5678  \n";
        let items = load_from_reader(input.as_bytes());
        assert_eq!(
            items,
            vec![
                ItemDescriptor {
                    name: "爪子刀（★） | 人工染色 (崭新出厂)".into(),
                    standard: Some("57387".into()),
                    premium: Some("60612".into()),
                },
                ItemDescriptor {
                    name: "AK-47 | 红线".into(),
                    standard: Some("1234".into()),
                    premium: Some("5678".into()),
                },
            ]
        );
    }

    #[test]
    fn missing_variant_key_is_kept_as_absent() {
        let items = load_from_reader("M4A4 | 咆哮,,999\nUSP-S | 脑洞大开,111,\n".as_bytes());
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].standard, None);
        assert_eq!(items[0].premium.as_deref(), Some("999"));
        assert_eq!(items[1].standard.as_deref(), Some("111"));
        assert_eq!(items[1].premium, None);
    }

    #[test]
    fn extra_columns_are_ignored() {
        let items = load_from_reader("a,1,2,note,more\n".as_bytes());
        assert_eq!(items, vec![ItemDescriptor::new("a", "1", "2")]);
    }

    #[test]
    fn quoted_names_with_commas() {
        let items = load_from_reader("\"Sticker | Team, Holo\",10,20\n".as_bytes());
        assert_eq!(items[0].name, "Sticker | Team, Holo");
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(load_from_reader("".as_bytes()).is_empty());
        assert!(load_from_reader("\n\n".as_bytes()).is_empty());
    }

    #[test]
    fn bom_prefixed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all("\u{feff}Butterfly Knife,1,2\n".as_bytes()).unwrap();
        let items = load(file.path()).unwrap();
        assert_eq!(items[0].name, "Butterfly Knife");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("items.csv")).is_err());
    }
}
