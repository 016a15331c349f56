use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::model::AddressableEntity;

/// Number of fallback levels produced for every entity.
pub const TIER_COUNT: usize = 4;

static ALT_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[;|\r\n]+").expect("separator pattern compiles"));
static TRAILING_POSTAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s+)\d{4,6}(?:-\d{4})?$").expect("postal pattern compiles")
});

const US_STATE_CODES: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY", "DC", "PR", "VI", "GU", "AS", "MP",
];

// (canonical name, lowercase aliases)
const COUNTRY_GAZETTEER: &[(&str, &[&str])] = &[
    (
        "USA",
        &[
            "usa",
            "us",
            "u.s.",
            "u.s.a.",
            "united states",
            "united states of america",
        ],
    ),
    ("Canada", &["canada"]),
    ("Mexico", &["mexico", "méxico"]),
    (
        "United Kingdom",
        &["uk", "u.k.", "united kingdom", "great britain", "england", "scotland", "wales"],
    ),
    ("Ireland", &["ireland"]),
    ("Australia", &["australia"]),
    ("New Zealand", &["new zealand"]),
    ("Germany", &["germany", "deutschland"]),
    ("France", &["france"]),
    ("Spain", &["spain", "españa"]),
    ("Italy", &["italy", "italia"]),
    ("Netherlands", &["netherlands", "the netherlands"]),
];

/// Structured pieces recovered from a free-text address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddressParts {
    pub without_postal: String,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
}

/// Ordered query tiers for one entity; tier 0 is the most specific.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateTiers {
    tiers: [Vec<String>; TIER_COUNT],
}

impl CandidateTiers {
    pub fn tier(&self, level: usize) -> &[String] {
        self.tiers.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total_queries(&self) -> usize {
        self.tiers.iter().map(Vec::len).sum()
    }

    fn push(&mut self, level: usize, query: String) {
        let query = query.trim().to_string();
        if query.is_empty() {
            return;
        }
        let tier = &mut self.tiers[level];
        if !tier.contains(&query) {
            tier.push(query);
        }
    }
}

#[derive(Debug, Clone)]
pub struct CandidateGenerator {
    default_country: String,
}

impl CandidateGenerator {
    pub fn new(default_country: impl Into<String>) -> Self {
        Self {
            default_country: default_country.into(),
        }
    }

    pub fn generate(&self, entity: &AddressableEntity) -> CandidateTiers {
        let mut tiers = CandidateTiers::default();
        let raw = entity
            .address
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let organization = entity
            .organization
            .as_deref()
            .map(collapse_whitespace)
            .filter(|value| !value.is_empty());
        let parts = raw.map(parse_address).unwrap_or_default();
        let country = parts
            .country
            .clone()
            .unwrap_or_else(|| self.default_country.clone());

        if let Some(raw) = raw {
            tiers.push(0, raw.to_string());
            tiers.push(0, parts.without_postal.clone());
            if let Some(org) = &organization {
                if !parts.without_postal.is_empty() {
                    tiers.push(0, format!("{org}, {}", parts.without_postal));
                }
            }
        }

        if let (Some(city), Some(region)) = (&parts.city, &parts.region) {
            tiers.push(1, format!("{city}, {region}, {country}"));
        }

        if let Some(region) = &parts.region {
            tiers.push(2, format!("{region}, {country}"));
        }
        if let Some(org) = &organization {
            tiers.push(2, format!("{org}, {country}"));
        }

        tiers.push(3, country);
        tiers
    }
}

/// Splits an address into comma-separated segments with whitespace collapsed.
pub fn normalize_address(raw: &str) -> Vec<String> {
    ALT_SEPARATORS
        .replace_all(raw, ",")
        .split(',')
        .map(collapse_whitespace)
        .filter(|segment| !segment.is_empty())
        .collect()
}

pub fn parse_address(raw: &str) -> AddressParts {
    let mut segments = normalize_address(raw);

    let country_segment = segments
        .last()
        .and_then(|last| match_country(last).map(|canonical| (last.clone(), canonical)));
    if country_segment.is_some() {
        segments.pop();
    }

    if let Some(last) = segments.last_mut() {
        let stripped = TRAILING_POSTAL.replace(last.as_str(), "").trim().to_string();
        *last = stripped;
        if last.is_empty() {
            segments.pop();
        }
    }

    let (city, region) = detect_region(&segments);

    let mut without_postal = segments.clone();
    if let Some((written, _)) = &country_segment {
        without_postal.push(written.clone());
    }

    AddressParts {
        without_postal: without_postal.join(", "),
        city,
        region,
        country: country_segment.map(|(_, canonical)| canonical.to_string()),
    }
}

fn detect_region(segments: &[String]) -> (Option<String>, Option<String>) {
    let Some(last) = segments.last() else {
        return (None, None);
    };

    let tokens: Vec<&str> = last.split_whitespace().collect();
    if let Some(code) = tokens.last().and_then(|token| state_code(token)) {
        let city = if tokens.len() > 1 {
            Some(tokens[..tokens.len() - 1].join(" "))
        } else if segments.len() >= 2 {
            Some(segments[segments.len() - 2].clone())
        } else {
            None
        };
        let city = city.filter(|value| !looks_like_street(value));
        return (city, Some(code));
    }

    if segments.len() >= 2 && !last.chars().any(|c| c.is_ascii_digit()) {
        return (None, Some(last.clone()));
    }
    (None, None)
}

fn state_code(token: &str) -> Option<String> {
    let upper = token.trim_matches('.').to_ascii_uppercase();
    if upper.len() == 2 && US_STATE_CODES.contains(&upper.as_str()) {
        Some(upper)
    } else {
        None
    }
}

fn match_country(segment: &str) -> Option<&'static str> {
    let lowered = segment.trim().to_lowercase();
    COUNTRY_GAZETTEER
        .iter()
        .find(|(_, aliases)| aliases.contains(&lowered.as_str()))
        .map(|(canonical, _)| *canonical)
}

fn looks_like_street(value: &str) -> bool {
    value.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> CandidateGenerator {
        CandidateGenerator::new("USA")
    }

    #[test]
    fn builds_all_tiers_for_full_us_address() {
        let entity = AddressableEntity::new("p1", "Buddy")
            .with_address("123 Elm St, Springfield, IL 62701")
            .with_organization("Happy Paws Rescue");
        let tiers = generator().generate(&entity);

        assert_eq!(
            tiers.tier(0),
            [
                "123 Elm St, Springfield, IL 62701",
                "123 Elm St, Springfield, IL",
                "Happy Paws Rescue, 123 Elm St, Springfield, IL",
            ]
        );
        assert_eq!(tiers.tier(1), ["Springfield, IL, USA"]);
        assert_eq!(tiers.tier(2), ["IL, USA", "Happy Paws Rescue, USA"]);
        assert_eq!(tiers.tier(3), ["USA"]);
    }

    #[test]
    fn entity_without_address_or_org_only_has_country_tier() {
        let tiers = generator().generate(&AddressableEntity::new("p2", "Milo"));
        assert!(tiers.tier(0).is_empty());
        assert!(tiers.tier(1).is_empty());
        assert!(tiers.tier(2).is_empty());
        assert_eq!(tiers.tier(3), ["USA"]);
        assert_eq!(tiers.total_queries(), 1);
    }

    #[test]
    fn organization_only_falls_to_tier_two() {
        let entity = AddressableEntity::new("p3", "Luna").with_organization("  Small Pet   Haven ");
        let tiers = generator().generate(&entity);
        assert!(tiers.tier(0).is_empty());
        assert!(tiers.tier(1).is_empty());
        assert_eq!(tiers.tier(2), ["Small Pet Haven, USA"]);
    }

    #[test]
    fn detects_trailing_country_and_strips_postal_before_it() {
        assert_eq!(
            normalize_address("500 King St W;  Toronto, ON M5V 1L9 ,Canada"),
            ["500 King St W", "Toronto", "ON M5V 1L9", "Canada"]
        );
        let parts = parse_address("500 King St W;  Toronto, ON M5V 1L9 ,Canada");
        assert_eq!(parts.country.as_deref(), Some("Canada"));
        assert_eq!(parts.without_postal, "500 King St W, Toronto, ON M5V 1L9, Canada");
        assert_eq!(parts.region, None);

        let us = parse_address("42 Oak Ave, Austin TX 78701-1234, United States");
        assert_eq!(us.without_postal, "42 Oak Ave, Austin TX, United States");
        assert_eq!(us.city.as_deref(), Some("Austin"));
        assert_eq!(us.region.as_deref(), Some("TX"));
        assert_eq!(us.country.as_deref(), Some("USA"));
    }

    #[test]
    fn uses_detected_country_in_fallbacks() {
        let entity = AddressableEntity::new("p4", "Rex").with_address("10 Downing St, London, UK");
        let tiers = generator().generate(&entity);
        assert_eq!(tiers.tier(2), ["London, United Kingdom"]);
        assert_eq!(tiers.tier(3), ["United Kingdom"]);
    }

    #[test]
    fn street_segment_is_not_taken_as_city() {
        let parts = parse_address("77 Harbor Rd, ME 04101");
        assert_eq!(parts.region.as_deref(), Some("ME"));
        assert_eq!(parts.city, None);
        assert_eq!(parts.without_postal, "77 Harbor Rd, ME");
    }
}
