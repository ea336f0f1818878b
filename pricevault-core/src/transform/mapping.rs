//! Per-provider field mapping tables.

use crate::domain::ProviderKind;

/// How a provider encodes bar timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFormat {
    EpochSeconds,
    /// Calendar date; the bar is stamped at midnight UTC.
    Date(&'static str),
    /// Naive date-time, interpreted as UTC.
    DateTime(&'static str),
}

/// Provider column names for each canonical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMap {
    pub provider: ProviderKind,
    /// Candidate timestamp columns; the first one present in the payload wins.
    pub timestamp: &'static [&'static str],
    /// Tried in order.
    pub time_formats: &'static [TimeFormat],
    pub open: &'static str,
    pub high: &'static str,
    pub low: &'static str,
    pub close: &'static str,
    pub volume: &'static str,
    /// `(provider column, canonical name)` pairs carried through unmodified.
    pub extras: &'static [(&'static str, &'static str)],
}

pub static BARCHART: FieldMap = FieldMap {
    provider: ProviderKind::Barchart,
    timestamp: &["timestamp", "tradingDay"],
    time_formats: &[
        TimeFormat::DateTime("%Y-%m-%d %H:%M"),
        TimeFormat::DateTime("%Y-%m-%d %H:%M:%S"),
        TimeFormat::Date("%Y-%m-%d"),
    ],
    open: "open",
    high: "high",
    low: "low",
    close: "close",
    volume: "volume",
    extras: &[("openInterest", "open_interest")],
};

pub static YAHOO: FieldMap = FieldMap {
    provider: ProviderKind::Yahoo,
    timestamp: &["timestamp"],
    time_formats: &[TimeFormat::EpochSeconds],
    open: "open",
    high: "high",
    low: "low",
    close: "close",
    volume: "volume",
    extras: &[("adjclose", "adj_close")],
};

pub static GATEWAY: FieldMap = FieldMap {
    provider: ProviderKind::Gateway,
    timestamp: &["time"],
    time_formats: &[TimeFormat::Date("%Y%m%d"), TimeFormat::EpochSeconds],
    open: "open",
    high: "high",
    low: "low",
    close: "close",
    volume: "volume",
    extras: &[("wap", "vwap"), ("barCount", "bar_count")],
};

impl FieldMap {
    pub fn for_provider(kind: ProviderKind) -> &'static FieldMap {
        match kind {
            ProviderKind::Barchart => &BARCHART,
            ProviderKind::Yahoo => &YAHOO,
            ProviderKind::Gateway => &GATEWAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_provider_has_a_map() {
        for kind in ProviderKind::ALL {
            assert_eq!(FieldMap::for_provider(kind).provider, kind);
        }
    }

    #[test]
    fn extras_use_distinct_canonical_names() {
        let mut names: Vec<&str> = ProviderKind::ALL
            .iter()
            .flat_map(|k| FieldMap::for_provider(*k).extras.iter().map(|(_, c)| *c))
            .collect();
        let before = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), before);
    }
}
