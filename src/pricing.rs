//! Cost model for links and the price list for coin packages.

/// Line items a link can be charged for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingRule {
    Base,
    Direct,
    Permanent,
}

impl PricingRule {
    /// Coins charged for this rule.
    pub const fn coins(self) -> u64 {
        match self {
            PricingRule::Base => 1,
            PricingRule::Direct => 1,
            PricingRule::Permanent => 1,
        }
    }
}

/// Coins charged for one link with the given flags.
pub fn cost(is_direct: bool, is_permanent: bool) -> u64 {
    let mut total = PricingRule::Base.coins();
    if is_direct {
        total += PricingRule::Direct.coins();
    }
    if is_permanent {
        total += PricingRule::Permanent.coins();
    }
    total
}

/// A coin bundle sold through checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditPackage {
    pub coins: u64,
    /// BRL cents
    pub price_cents: u64,
}

pub const CREDIT_PACKAGES: [CreditPackage; 4] = [
    CreditPackage { coins: 10, price_cents: 599 },
    CreditPackage { coins: 20, price_cents: 1099 },
    CreditPackage { coins: 50, price_cents: 2499 },
    CreditPackage { coins: 100, price_cents: 3999 },
];

/// Price of the package holding exactly `coins`, if one is on sale.
pub fn package_price(coins: u64) -> Option<u64> {
    CREDIT_PACKAGES
        .iter()
        .find(|package| package.coins == coins)
        .map(|package| package.price_cents)
}
