/// 単位の定義。相対単位（面積あたりの量）は集約時に面積で重み付けされる
#[derive(Debug, Clone, PartialEq)]
pub struct Units {
    pub label: String,
    pub relative: bool,
    /// km²基準からの倍率（例: population/ha は 100）
    pub multiplier: f64,
}

/// (ラベル, 相対単位か, 倍率)。倍率は相対単位の合計集約にだけ掛かるので、
/// 絶対単位の Percentage の 100 は出力値に影響しない
const PREDEFINED: &[(&str, bool, f64)] = &[
    ("None", false, 1.0),
    ("category", false, 1.0),
    ("Count", false, 1.0),
    ("Index", false, 1.0),
    ("population/SqKm2", true, 1.0),
    ("population/ha", true, 100.0),
    ("AMSL", false, 1.0),
    ("Percentage", false, 100.0),
    ("Yield : tons / ha", true, 100.0),
    ("Minutes", false, 1.0),
    ("Hours", false, 1.0),
    ("kWh/m2", true, 1.0),
    ("mm/Year", false, 1.0),
    ("PPP USD", false, 1.0),
    ("Radiance", false, 1.0),
];

impl Units {
    pub fn predefined_labels() -> impl Iterator<Item = &'static str> {
        PREDEFINED.iter().map(|(label, _, _)| *label)
    }

    /// 定義済みの単位。範囲外は "n/a"
    pub fn predefined(index: usize) -> Self {
        match PREDEFINED.get(index) {
            Some((label, relative, multiplier)) => Self {
                label: label.to_string(),
                relative: *relative,
                multiplier: *multiplier,
            },
            None => Self::custom("n/a"),
        }
    }

    /// 任意の単位文字列（常に絶対単位）
    pub fn custom(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            relative: false,
            multiplier: 1.0,
        }
    }

    /// 数字なら定義済み、それ以外は任意の単位
    pub fn parse(value: &str) -> Self {
        match value.trim().parse::<usize>() {
            Ok(index) => Self::predefined(index),
            Err(_) => Self::custom(value.trim()),
        }
    }

    /// ヘッダーに書き出す値があるかどうか
    pub fn is_set(&self) -> bool {
        let label = self.label.trim();
        !label.is_empty() && label != "Insert Units"
    }
}

impl Default for Units {
    fn default() -> Self {
        Self::custom("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_units() {
        let density = Units::predefined(4);
        assert_eq!(density.label, "population/SqKm2");
        assert!(density.relative);
        assert_eq!(density.multiplier, 1.0);

        let per_hectare = Units::predefined(5);
        assert!(per_hectare.relative);
        assert_eq!(per_hectare.multiplier, 100.0);
    }

    #[test]
    fn test_parse_custom_and_index() {
        assert_eq!(Units::parse("6").label, "AMSL");
        let custom = Units::parse("People per building");
        assert_eq!(custom.label, "People per building");
        assert!(!custom.relative);
    }

    #[test]
    fn test_out_of_range_index() {
        assert_eq!(Units::predefined(99).label, "n/a");
    }

    #[test]
    fn test_placeholder_is_not_set() {
        assert!(!Units::custom("Insert Units").is_set());
        assert!(!Units::default().is_set());
        assert!(Units::predefined(2).is_set());
    }
}
