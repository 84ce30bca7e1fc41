use serde::{Deserialize, Serialize};

const MAX_HOUSE_TOKEN_CHARS: usize = 6;
const MIN_STRUCTURED_FIELDS: usize = 2;

const REGION_KEYWORDS: &[&str] = &["обл", "область", "області", "oblast", "region"];

const STREET_KEYWORDS: &[&str] = &[
    // street
    "вул", "вулиця", "ул", "улица", "street", "st",
    // lane
    "пров", "провулок", "пер", "переулок", "lane",
    // avenue
    "просп", "проспект", "пр-т", "avenue", "ave",
    // passage
    "проїзд", "проезд", "passage",
    // square
    "пл", "площа", "площадь", "square",
    // boulevard
    "бульв", "бульвар", "б-р", "boulevard",
    // embankment
    "наб", "набережна", "набережная", "embankment",
    // descent
    "узвіз", "спуск", "descent",
    // dead-end
    "тупик", "dead-end",
];

const SETTLEMENT_MARKERS: &[&str] = &[
    "с", "село", "смт", "сел", "с-ще", "селище", "м", "місто", "пгт", "г", "город", "пос",
    "поселок", "посёлок", "village", "town",
];

const BUILDING_KEYWORDS: &[&str] = &["буд", "будинок", "д", "дом", "bld", "building"];
const APARTMENT_KEYWORDS: &[&str] = &["кв", "квартира", "apt", "apartment"];

/// Components extracted from a free-text postal address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredAddress {
    pub settlement: Option<String>,
    pub street: Option<String>,
    pub house: Option<String>,
    pub region: Option<String>,
    pub zip: Option<String>,
}

impl StructuredAddress {
    pub fn field_count(&self) -> usize {
        [
            &self.settlement,
            &self.street,
            &self.house,
            &self.region,
            &self.zip,
        ]
        .iter()
        .filter(|field| field.is_some())
        .count()
    }

    /// Fewer than two fields is not enough structure to rebuild a query from.
    pub fn is_degenerate(&self) -> bool {
        self.field_count() < MIN_STRUCTURED_FIELDS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenClass {
    Zip,
    Region,
    Street,
    Settlement,
    House,
}

/// Parses a comma separated address into its components.
///
/// Each token is classified on its own, first matching rule wins: zip, region,
/// street, settlement, house. Tokens matching nothing are dropped, and when two
/// tokens land on the same field the earlier one is kept.
pub fn normalize(raw: &str) -> StructuredAddress {
    let mut address = StructuredAddress::default();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let Some(class) = classify(token) else {
            continue;
        };
        let (slot, value) = match class {
            TokenClass::Zip => (&mut address.zip, Some(token.to_string())),
            TokenClass::Region => (&mut address.region, Some(token.to_string())),
            TokenClass::Street => (&mut address.street, Some(token.to_string())),
            TokenClass::Settlement => (
                &mut address.settlement,
                non_empty(strip_keywords(token, &[SETTLEMENT_MARKERS])),
            ),
            TokenClass::House => (
                &mut address.house,
                non_empty(strip_keywords(
                    token,
                    &[BUILDING_KEYWORDS, APARTMENT_KEYWORDS],
                )),
            ),
        };
        if slot.is_none() {
            *slot = value;
        }
    }
    address
}

/// Rebuilds a cleaned query string for manual geocoding retries.
///
/// When the parse yields fewer than two fields the raw input is returned
/// untouched; downstream retries rely on seeing the operator's original text.
pub fn smart_address(raw: &str) -> String {
    let address = normalize(raw);
    if address.is_degenerate() {
        return raw.to_string();
    }

    let building = match (&address.street, &address.house) {
        (Some(street), Some(house)) => Some(format!("{street} {house}")),
        (Some(street), None) => Some(street.clone()),
        (None, Some(house)) => Some(house.clone()),
        (None, None) => None,
    };

    [
        address.zip.clone(),
        address.region.clone(),
        address.settlement.clone(),
        building,
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(", ")
}

fn classify(token: &str) -> Option<TokenClass> {
    if is_zip(token) {
        return Some(TokenClass::Zip);
    }
    let words = words(token);
    if has_keyword(&words, REGION_KEYWORDS) {
        return Some(TokenClass::Region);
    }
    if has_keyword(&words, STREET_KEYWORDS) {
        return Some(TokenClass::Street);
    }
    if has_keyword(&words, SETTLEMENT_MARKERS) {
        return Some(TokenClass::Settlement);
    }
    let short = token.chars().count() < MAX_HOUSE_TOKEN_CHARS;
    let starts_with_digit = token.chars().next().is_some_and(|c| c.is_ascii_digit());
    if short && (starts_with_digit || has_keyword(&words, BUILDING_KEYWORDS)) {
        return Some(TokenClass::House);
    }
    None
}

fn is_zip(token: &str) -> bool {
    token.len() == 5 && token.bytes().all(|b| b.is_ascii_digit())
}

fn words(token: &str) -> Vec<String> {
    token
        .split(|c: char| c.is_whitespace() || c == '.')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn has_keyword(words: &[String], keywords: &[&str]) -> bool {
    words.iter().any(|word| keywords.contains(&word.as_str()))
}

fn is_keyword(word: &str, groups: &[&[&str]]) -> bool {
    let lowered = word.to_lowercase();
    groups.iter().any(|group| group.contains(&lowered.as_str()))
}

/// Drops keyword pieces ("с.", "смт", "буд.") and keyword prefixes glued to the
/// value ("с.Циркуни", "буд.5"), keeping the remaining pieces in order.
fn strip_keywords(token: &str, groups: &[&[&str]]) -> String {
    token
        .split_whitespace()
        .filter_map(|piece| {
            if is_keyword(piece.trim_end_matches('.'), groups) {
                return None;
            }
            if let Some((head, tail)) = piece.split_once('.') {
                if is_keyword(head, groups) {
                    return Some(tail.trim_start_matches('.').to_string());
                }
            }
            Some(piece.to_string())
        })
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_ADDRESS: &str = "61037, Харківська обл., с. Циркуни, вул. Сонячна, 12";

    #[test]
    fn parses_full_ukrainian_address() {
        let address = normalize(FULL_ADDRESS);
        assert_eq!(address.zip.as_deref(), Some("61037"));
        assert_eq!(address.region.as_deref(), Some("Харківська обл."));
        assert_eq!(address.settlement.as_deref(), Some("Циркуни"));
        assert_eq!(address.street.as_deref(), Some("вул. Сонячна"));
        assert_eq!(address.house.as_deref(), Some("12"));
        assert_eq!(address.field_count(), 5);
    }

    #[test]
    fn normalization_is_deterministic() {
        let inputs = [
            FULL_ADDRESS,
            "смт Пісочин, пров. Тихий, буд.5",
            "просто текст",
            "",
        ];
        for raw in inputs {
            assert_eq!(normalize(raw), normalize(raw));
        }
    }

    #[test]
    fn strips_settlement_markers_in_any_form() {
        assert_eq!(
            normalize("смт Пісочин").settlement.as_deref(),
            Some("Пісочин")
        );
        assert_eq!(
            normalize("с.Циркуни").settlement.as_deref(),
            Some("Циркуни")
        );
        assert_eq!(
            normalize("м. Нова Водолага").settlement.as_deref(),
            Some("Нова Водолага")
        );
    }

    #[test]
    fn extracts_house_from_building_keyword() {
        let address = normalize("с. Малі Проходи, пров. Тихий, буд.5");
        assert_eq!(address.street.as_deref(), Some("пров. Тихий"));
        assert_eq!(address.house.as_deref(), Some("5"));
    }

    #[test]
    fn long_tokens_are_never_houses() {
        let address = normalize("с. Циркуни, 12 квартал Сонячний");
        assert!(address.house.is_none());
        assert_eq!(address.field_count(), 1);
    }

    #[test]
    fn apartment_only_token_is_discarded() {
        let address = normalize("с. Циркуни, вул. Сонячна, 12, кв. 3");
        assert_eq!(address.house.as_deref(), Some("12"));
    }

    #[test]
    fn first_token_wins_for_repeated_field() {
        let address = normalize("вул. Сонячна, вул. Польова");
        assert_eq!(address.street.as_deref(), Some("вул. Сонячна"));
    }

    #[test]
    fn region_takes_priority_over_settlement_marker() {
        let address = normalize("м. Харків обл.");
        assert!(address.region.is_some());
        assert!(address.settlement.is_none());
    }

    #[test]
    fn smart_address_returns_raw_when_degenerate() {
        let raw = "  Циркуни біля ставка ";
        assert_eq!(smart_address(raw), raw);
        assert_eq!(smart_address("с. Циркуни"), "с. Циркуни");
    }

    #[test]
    fn smart_address_rebuilds_query_text() {
        assert_eq!(
            smart_address(FULL_ADDRESS),
            "61037, Харківська обл., Циркуни, вул. Сонячна 12"
        );
        assert_eq!(
            smart_address("с. Циркуни, вул. Сонячна"),
            "Циркуни, вул. Сонячна"
        );
    }
}
