//! Paper account ledger

use serde::{Deserialize, Serialize};

use crate::types::PositionSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TradeCounters {
    pub total: u32,
    pub wins: u32,
    pub losses: u32,
    pub breakeven: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Net of fees
    pub realized_pnl: f64,
    pub fees: f64,
    pub closed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperAccountSnapshot {
    pub starting_balance: f64,
    pub balance: f64,
    pub equity: f64,
    pub total_realized_pnl: f64,
    pub max_equity: f64,
    pub max_drawdown: f64,
    pub trades: TradeCounters,
    pub last_trade: Option<ClosedTrade>,
}

/// Balance moves only when a trade closes; equity is marked on snapshot.
#[derive(Debug, Clone)]
pub struct PaperAccount {
    starting_balance: f64,
    balance: f64,
    total_realized_pnl: f64,
    max_equity: f64,
    max_drawdown: f64,
    trades: TradeCounters,
    last_trade: Option<ClosedTrade>,
}

impl PaperAccount {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            starting_balance,
            balance: starting_balance,
            total_realized_pnl: 0.0,
            max_equity: starting_balance,
            max_drawdown: 0.0,
            trades: TradeCounters::default(),
            last_trade: None,
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn register_close(&mut self, trade: ClosedTrade) {
        self.balance += trade.realized_pnl;
        self.total_realized_pnl += trade.realized_pnl;

        self.trades.total += 1;
        if trade.realized_pnl > 0.0 {
            self.trades.wins += 1;
        } else if trade.realized_pnl < 0.0 {
            self.trades.losses += 1;
        } else {
            self.trades.breakeven += 1;
        }
        self.last_trade = Some(trade);
    }

    /// Mark equity at `unrealized_pnl` and update the running extremes.
    pub fn snapshot(&mut self, unrealized_pnl: f64) -> PaperAccountSnapshot {
        let equity = self.balance + unrealized_pnl;
        self.max_equity = self.max_equity.max(equity);
        self.max_drawdown = self.max_drawdown.max(self.max_equity - equity);

        PaperAccountSnapshot {
            starting_balance: self.starting_balance,
            balance: self.balance,
            equity,
            total_realized_pnl: self.total_realized_pnl,
            max_equity: self.max_equity,
            max_drawdown: self.max_drawdown,
            trades: self.trades,
            last_trade: self.last_trade.clone(),
        }
    }
}
