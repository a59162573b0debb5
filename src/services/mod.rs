pub mod backtest;
pub mod decision;
pub mod executor;
pub mod live;
pub mod validator;

#[cfg(test)]
mod backtest_tests;
