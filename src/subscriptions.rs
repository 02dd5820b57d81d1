//! Stream topic bookkeeping: which streams the system needs versus which are
//! currently subscribed.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::candles::Timeframe;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Ticker(String),
    Kline(String, Timeframe),
}

/// Renders the exchange stream name, e.g. `btcusdt@kline_15m`.
impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Ticker(s) => write!(f, "{}@ticker", s.to_lowercase()),
            Topic::Kline(s, tf) => write!(f, "{}@kline_{}", s.to_lowercase(), tf),
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sym, stream) = s.split_once('@').ok_or_else(|| format!("bad topic {s}"))?;
        let sym = sym.to_uppercase();
        if stream == "ticker" {
            return Ok(Topic::Ticker(sym));
        }
        let tf = stream.strip_prefix("kline_").ok_or_else(|| format!("bad topic {s}"))?;
        Ok(Topic::Kline(sym, tf.parse()?))
    }
}

/// Required topics: a ticker for every monitored or held symbol, 15m klines
/// for monitored symbols, 1m klines for the hotlist.
pub fn required_topics<'a>(
    monitored: impl IntoIterator<Item = &'a str>,
    hotlist: impl IntoIterator<Item = &'a str>,
    position_symbols: impl IntoIterator<Item = &'a str>,
) -> BTreeSet<Topic> {
    let mut out = BTreeSet::new();
    for s in monitored {
        out.insert(Topic::Ticker(s.to_string()));
        out.insert(Topic::Kline(s.to_string(), Timeframe::M15));
    }
    for s in hotlist {
        out.insert(Topic::Kline(s.to_string(), Timeframe::M1));
    }
    for s in position_symbols {
        out.insert(Topic::Ticker(s.to_string()));
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPlan {
    pub subscribe: Vec<Topic>,
    pub unsubscribe: Vec<Topic>,
}

impl SubscriptionPlan {
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionManager {
    subscribed: BTreeSet<Topic>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribed(&self) -> &BTreeSet<Topic> {
        &self.subscribed
    }

    /// Diffs `required` against the current set and adopts it. After this
    /// call the subscribed set equals `required` exactly.
    pub fn reconcile(&mut self, required: BTreeSet<Topic>) -> SubscriptionPlan {
        let plan = SubscriptionPlan {
            subscribe: required.difference(&self.subscribed).cloned().collect(),
            unsubscribe: self.subscribed.difference(&required).cloned().collect(),
        };
        self.subscribed = required;
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names_round_trip() {
        let t = Topic::Kline("BTCUSDT".into(), Timeframe::M15);
        assert_eq!(t.to_string(), "btcusdt@kline_15m");
        assert_eq!("btcusdt@kline_15m".parse::<Topic>(), Ok(t));
        assert_eq!(Topic::Ticker("ETHUSDT".into()).to_string(), "ethusdt@ticker");
        assert!("ethusdt@depth".parse::<Topic>().is_err());
    }

    #[test]
    fn test_required_topics_union() {
        let req = required_topics(["A", "B"], ["B"], ["C"]);
        assert_eq!(req.len(), 6);
        assert!(req.contains(&Topic::Kline("B".into(), Timeframe::M1)));
        assert!(req.contains(&Topic::Ticker("C".into())));
        assert!(!req.contains(&Topic::Kline("C".into(), Timeframe::M15)));
    }

    #[test]
    fn test_reconcile_is_exact_diff() {
        let mut m = SubscriptionManager::new();
        let first = m.reconcile(required_topics(["A", "B"], [], []));
        assert_eq!(first.subscribe.len(), 4);
        assert!(first.unsubscribe.is_empty());

        let second = m.reconcile(required_topics(["B", "C"], ["C"], []));
        assert_eq!(
            second.unsubscribe,
            vec![Topic::Ticker("A".into()), Topic::Kline("A".into(), Timeframe::M15)]
        );
        assert_eq!(second.subscribe.len(), 3);
        assert_eq!(m.subscribed(), &required_topics(["B", "C"], ["C"], []));

        assert!(m.reconcile(required_topics(["B", "C"], ["C"], [])).is_empty());
    }
}
