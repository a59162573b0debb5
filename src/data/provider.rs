use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{Kline, PriceChange, RegimeInfo};

/// Historical bars keyed by `"{symbol}_{period}"`.
pub type KlineSeries = HashMap<String, Vec<Kline>>;

pub fn series_key(symbol: &str, period: &str) -> String {
    format!("{}_{}", symbol, period)
}

/// Market data reachable from strategy code through the snapshot.
///
/// Implementations must only expose information that was knowable at the
/// snapshot's point in time.
pub trait DataProvider: Send + Sync {
    fn get_klines(&self, symbol: &str, period: &str, count: usize) -> Vec<Kline>;
    fn get_indicator(&self, symbol: &str, indicator: &str, period: &str) -> HashMap<String, f64>;
    fn get_flow(&self, symbol: &str, metric: &str, period: &str) -> HashMap<String, f64>;
    fn get_regime(&self, symbol: &str, period: &str) -> RegimeInfo;
    fn get_price_change(&self, symbol: &str, period: &str) -> PriceChange;
}

/// Provider for snapshots that carry no history (live triggers, tests).
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyDataProvider;

impl DataProvider for EmptyDataProvider {
    fn get_klines(&self, _symbol: &str, _period: &str, _count: usize) -> Vec<Kline> {
        Vec::new()
    }

    fn get_indicator(&self, _symbol: &str, _indicator: &str, _period: &str) -> HashMap<String, f64> {
        HashMap::new()
    }

    fn get_flow(&self, _symbol: &str, _metric: &str, _period: &str) -> HashMap<String, f64> {
        HashMap::new()
    }

    fn get_regime(&self, _symbol: &str, _period: &str) -> RegimeInfo {
        RegimeInfo::default()
    }

    fn get_price_change(&self, _symbol: &str, _period: &str) -> PriceChange {
        PriceChange::default()
    }
}

/// Key of a precomputed per-bar value (indicator, flow metric or regime).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndicatorKey {
    pub symbol: String,
    pub name: String,
    pub period: String,
    pub index: usize,
}

impl IndicatorKey {
    pub fn new(symbol: &str, name: &str, period: &str, index: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            name: name.to_string(),
            period: period.to_string(),
            index,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct HistoryTables {
    values: HashMap<IndicatorKey, HashMap<String, f64>>,
    regimes: HashMap<IndicatorKey, RegimeInfo>,
}

const REGIME: &str = "regime";

/// Replays stored history behind a cursor.
///
/// The backtest loop owns the cursor (`advance_to`); strategies only ever see
/// a [`view`](Self::view) pinned at the bar being evaluated, so every query is
/// bounded to bars `<= current_index`.
#[derive(Clone, Debug, Default)]
pub struct HistoricalDataProvider {
    klines: Arc<KlineSeries>,
    tables: Arc<HistoryTables>,
    current_index: usize,
}

impl HistoricalDataProvider {
    pub fn new(klines: KlineSeries) -> Self {
        Self {
            klines: Arc::new(klines),
            tables: Arc::new(HistoryTables::default()),
            current_index: 0,
        }
    }

    /// Register indicator or flow values for one bar.
    pub fn with_values(mut self, key: IndicatorKey, values: HashMap<String, f64>) -> Self {
        Arc::make_mut(&mut self.tables).values.insert(key, values);
        self
    }

    pub fn with_regime(mut self, symbol: &str, period: &str, index: usize, regime: RegimeInfo) -> Self {
        Arc::make_mut(&mut self.tables)
            .regimes
            .insert(IndicatorKey::new(symbol, REGIME, period, index), regime);
        self
    }

    pub fn advance_to(&mut self, index: usize) {
        self.current_index = index;
    }

    pub fn series(&self, symbol: &str, period: &str) -> Option<&[Kline]> {
        self.klines.get(&series_key(symbol, period)).map(Vec::as_slice)
    }

    /// Immutable provider frozen at the current cursor.
    pub fn view(&self) -> Arc<dyn DataProvider> {
        Arc::new(self.clone())
    }

    /// Exclusive end of the visible part of a series.
    fn visible_end(&self, len: usize) -> usize {
        (self.current_index + 1).min(len)
    }

    fn lookup(&self, symbol: &str, name: &str, period: &str) -> HashMap<String, f64> {
        let key = IndicatorKey::new(symbol, name, period, self.current_index);
        self.tables.values.get(&key).cloned().unwrap_or_default()
    }
}

impl DataProvider for HistoricalDataProvider {
    fn get_klines(&self, symbol: &str, period: &str, count: usize) -> Vec<Kline> {
        match self.series(symbol, period) {
            Some(bars) => {
                let end = self.visible_end(bars.len());
                let start = end.saturating_sub(count);
                bars[start..end].to_vec()
            }
            None => Vec::new(),
        }
    }

    fn get_indicator(&self, symbol: &str, indicator: &str, period: &str) -> HashMap<String, f64> {
        self.lookup(symbol, indicator, period)
    }

    fn get_flow(&self, symbol: &str, metric: &str, period: &str) -> HashMap<String, f64> {
        self.lookup(symbol, metric, period)
    }

    fn get_regime(&self, symbol: &str, period: &str) -> RegimeInfo {
        let key = IndicatorKey::new(symbol, REGIME, period, self.current_index);
        self.tables.regimes.get(&key).cloned().unwrap_or_default()
    }

    fn get_price_change(&self, symbol: &str, period: &str) -> PriceChange {
        let Some(bars) = self.series(symbol, period) else {
            return PriceChange::default();
        };
        let end = self.visible_end(bars.len());
        if end < 2 {
            return PriceChange::default();
        }
        let current = bars[end - 1].close;
        let previous = bars[end - 2].close;
        let change_usd = current - previous;
        let change_percent = if previous != 0.0 {
            change_usd / previous * 100.0
        } else {
            0.0
        };
        PriceChange {
            change_percent,
            change_usd,
        }
    }
}
