use std::fmt;

use url::Url;

/// Cosmetic quality tier shown on every listing page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WearCondition {
    FactoryNew,
    MinimalWear,
    FieldTested,
    WellWorn,
    BattleScarred,
}

impl WearCondition {
    pub const ALL: [WearCondition; 5] = [
        WearCondition::FactoryNew,
        WearCondition::MinimalWear,
        WearCondition::FieldTested,
        WearCondition::WellWorn,
        WearCondition::BattleScarred,
    ];

    /// Label as rendered by the marketplace. Recognition matches on this.
    pub fn label(self) -> &'static str {
        match self {
            WearCondition::FactoryNew => "崭新出厂",
            WearCondition::MinimalWear => "略有磨损",
            WearCondition::FieldTested => "久经沙场",
            WearCondition::WellWorn => "破损不堪",
            WearCondition::BattleScarred => "战痕累累",
        }
    }

    pub fn english(self) -> &'static str {
        match self {
            WearCondition::FactoryNew => "Factory New",
            WearCondition::MinimalWear => "Minimal Wear",
            WearCondition::FieldTested => "Field-Tested",
            WearCondition::WellWorn => "Well-Worn",
            WearCondition::BattleScarred => "Battle-Scarred",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for WearCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Standard,
    Premium,
}

impl Variant {
    pub fn label(self) -> &'static str {
        match self {
            Variant::Standard => "普通",
            Variant::Premium => "暗金",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Marketplace page mode for a template id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ListType {
    Sell,
    Rent,
}

impl ListType {
    pub const ALL: [ListType; 2] = [ListType::Sell, ListType::Rent];

    pub fn code(self) -> u32 {
        match self {
            ListType::Sell => 10,
            ListType::Rent => 30,
        }
    }
}

impl fmt::Display for ListType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListType::Sell => f.write_str("sell"),
            ListType::Rent => f.write_str("rent"),
        }
    }
}

/// One catalog row. Variant keys are opaque; `None` means the variant is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescriptor {
    pub name: String,
    pub standard: Option<String>,
    pub premium: Option<String>,
}

impl ItemDescriptor {
    pub fn new(name: &str, standard: &str, premium: &str) -> Self {
        ItemDescriptor {
            name: name.trim().to_string(),
            standard: non_empty(standard),
            premium: non_empty(premium),
        }
    }

    /// Present variants in collection order (standard first).
    pub fn variants(&self) -> impl Iterator<Item = (Variant, &str)> {
        [
            (Variant::Standard, self.standard.as_deref()),
            (Variant::Premium, self.premium.as_deref()),
        ]
        .into_iter()
        .filter_map(|(variant, id)| id.map(|id| (variant, id)))
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Total map from every wear condition to an optional price.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PriceMap([Option<f64>; 5]);

impl PriceMap {
    pub fn get(&self, wear: WearCondition) -> Option<f64> {
        self.0[wear.index()]
    }

    pub fn set(&mut self, wear: WearCondition, price: f64) {
        self.0[wear.index()] = Some(price);
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    pub fn found(&self) -> usize {
        self.0.iter().filter(|p| p.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WearCondition, Option<f64>)> + '_ {
        WearCondition::ALL.into_iter().map(|w| (w, self.get(w)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceObservation {
    pub item_name: String,
    pub variant: Variant,
    pub wear: WearCondition,
    pub sell: Option<f64>,
    pub rent: Option<f64>,
}

impl PriceObservation {
    /// Rent as a percentage of sell. Needs both sides and a positive sell price.
    pub fn rent_ratio(&self) -> Option<f64> {
        match (self.sell, self.rent) {
            (Some(sell), Some(rent)) if sell > 0.0 => Some(rent / sell * 100.0),
            _ => None,
        }
    }
}

/// Merge the sell and rent pages of one variant into five observations.
pub fn merge_observations(
    item_name: &str,
    variant: Variant,
    sell: &PriceMap,
    rent: &PriceMap,
) -> Vec<PriceObservation> {
    WearCondition::ALL
        .into_iter()
        .map(|wear| PriceObservation {
            item_name: item_name.to_string(),
            variant,
            wear,
            sell: sell.get(wear),
            rent: rent.get(wear),
        })
        .collect()
}

/// `<base>?listType=<10|30>&templateId=<id>&gameId=<game>`
pub fn listing_url(
    base_url: &str,
    game_id: u32,
    template_id: &str,
    list_type: ListType,
) -> Result<Url, url::ParseError> {
    Url::parse_with_params(
        base_url,
        &[
            ("listType", list_type.code().to_string()),
            ("templateId", template_id.to_string()),
            ("gameId", game_id.to_string()),
        ],
    )
}
