pub mod provider;

pub use provider::{
    series_key, DataProvider, EmptyDataProvider, HistoricalDataProvider, IndicatorKey, KlineSeries,
};
