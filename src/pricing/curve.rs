use rust_decimal::prelude::*;
use rust_decimal::MathematicalOps;

use crate::error::{AppError, AppResult};

/// Smallest base-currency unit (one satoshi). Reserve ratios are floored here
/// so the curve stays defined for an empty pool.
pub const MIN_BASE_UNIT: Decimal = Decimal::from_parts(1, 0, 0, false, 8);

const BASE_DECIMALS: u32 = 8;

/// Bonding curve anchored to the pool's initial reserves.
///
/// The per-token reference price is the initial market cap over the initial
/// token supply. The spot price scales it by `base_balance / initial_base`, so
/// quoted in base currency one token costs `base_balance / initial_token`.
/// Integrating that price gives the token balance the pool should hold at any
/// reserve level: `initial_token * (1 - ln(base_balance / initial_base))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BondingCurve {
    initial_base: Decimal,
    initial_token: Decimal,
    token_decimals: u32,
}

impl BondingCurve {
    pub fn new(initial_base: Decimal, initial_token: Decimal) -> AppResult<Self> {
        if initial_base <= Decimal::ZERO {
            return Err(AppError::Config(format!(
                "bonding curve needs a positive initial base balance, got {}",
                initial_base
            )));
        }
        if initial_token <= Decimal::ZERO {
            return Err(AppError::Config(format!(
                "bonding curve needs a positive initial token balance, got {}",
                initial_token
            )));
        }

        Ok(Self {
            initial_base,
            initial_token,
            token_decimals: 8,
        })
    }

    pub fn with_token_decimals(mut self, decimals: u32) -> Self {
        self.token_decimals = decimals;
        self
    }

    pub fn initial_base(&self) -> Decimal {
        self.initial_base
    }

    pub fn initial_token(&self) -> Decimal {
        self.initial_token
    }

    /// Reference per-token price at the anchor point, in the reference currency
    pub fn reference_price(&self, usd_per_base: Decimal) -> Decimal {
        usd_per_base * self.initial_base / self.initial_token
    }

    /// Token price in the reference currency at the given reserve level
    pub fn spot_price(&self, base_balance: Decimal, usd_per_base: Decimal) -> Decimal {
        let base_balance = base_balance.max(Decimal::ZERO);
        self.reference_price(usd_per_base) * (base_balance / self.initial_base)
    }

    /// Token price in base currency. Floored at one base unit of reserve.
    pub fn base_per_token(&self, base_balance: Decimal) -> Decimal {
        base_balance.max(MIN_BASE_UNIT) / self.initial_token
    }

    /// Tokens the pool should be holding at this base reserve level
    pub fn effective_token_balance(&self, base_balance: Decimal) -> Decimal {
        let ratio = base_balance.max(MIN_BASE_UNIT) / self.initial_base;
        let ln_ratio = ratio.checked_ln().unwrap_or(Decimal::ZERO);

        let effective = self.initial_token * (Decimal::ONE - ln_ratio);
        effective
            .max(Decimal::ZERO)
            .round_dp_with_strategy(self.token_decimals, RoundingStrategy::ToZero)
    }

    /// Tokens owed for a base payment, priced at the `base_balance` snapshot
    pub fn tokens_for_base(&self, base_in: Decimal, base_balance: Decimal) -> Decimal {
        (base_in / self.base_per_token(base_balance))
            .round_dp_with_strategy(self.token_decimals, RoundingStrategy::ToZero)
    }

    /// Base currency owed for a token payment, priced at the `base_balance` snapshot
    pub fn base_for_tokens(&self, tokens_in: Decimal, base_balance: Decimal) -> Decimal {
        (tokens_in * self.base_per_token(base_balance))
            .round_dp_with_strategy(BASE_DECIMALS, RoundingStrategy::ToZero)
    }
}
