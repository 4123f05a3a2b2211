use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

use crate::domain::{Error, Money, OverdraftPolicy};

/// Bank settings, read once at startup.
#[derive(Debug, Clone)]
pub struct BankConfig {
    pub bank_code: String,
    pub bank_name: String,
    pub currency: String,
    pub initial_capital: Money,
    /// Applied to every checking account this bank opens.
    pub overdraft: OverdraftPolicy,
    pub peers: Vec<PeerBank>,
    pub settlement: SettlementPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBank {
    pub code: String,
    pub initial_capital: Money,
}

/// Retry policy for the remote leg of an interbank transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SettlementPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(2_000),
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2_000),
        }
    }
}

impl SettlementPolicy {
    /// Delay after the given failed attempt (1-based): base, 2*base, 4*base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            bank_code: "vbank".to_owned(),
            bank_name: "Virtual Bank".to_owned(),
            currency: "RUB".to_owned(),
            initial_capital: Money::from_major(10_000_000),
            overdraft: OverdraftPolicy::None,
            peers: vec![
                PeerBank {
                    code: "abank".to_owned(),
                    initial_capital: Money::from_major(10_000_000),
                },
                PeerBank {
                    code: "sbank".to_owned(),
                    initial_capital: Money::from_major(10_000_000),
                },
            ],
            settlement: SettlementPolicy::default(),
        }
    }
}

impl BankConfig {
    pub fn from_env() -> Result<Self, Error> {
        dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key/value source, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let defaults = Self::default();
        let settlement = SettlementPolicy {
            max_attempts: parse_or(&lookup, "SETTLEMENT_MAX_ATTEMPTS", defaults.settlement.max_attempts)?,
            attempt_timeout: millis_or(&lookup, "SETTLEMENT_ATTEMPT_TIMEOUT_MS", defaults.settlement.attempt_timeout)?,
            base_backoff: millis_or(&lookup, "SETTLEMENT_BACKOFF_MS", defaults.settlement.base_backoff)?,
            max_backoff: millis_or(&lookup, "SETTLEMENT_MAX_BACKOFF_MS", defaults.settlement.max_backoff)?,
        };
        if settlement.max_attempts == 0 {
            return Err(Error::Config("SETTLEMENT_MAX_ATTEMPTS must be at least 1".to_owned()));
        }

        let bank_code = lookup("BANK_CODE").unwrap_or(defaults.bank_code);
        let peers = match lookup("PEER_BANKS") {
            Some(raw) => parse_peers(&raw)?,
            None => defaults.peers,
        };
        if peers.iter().any(|peer| peer.code == bank_code) {
            return Err(Error::Config(format!(
                "PEER_BANKS must not list the local bank {}",
                bank_code
            )));
        }

        Ok(BankConfig {
            bank_code,
            bank_name: lookup("BANK_NAME").unwrap_or(defaults.bank_name),
            currency: lookup("BANK_CURRENCY").unwrap_or(defaults.currency),
            initial_capital: parse_or(&lookup, "BANK_INITIAL_CAPITAL", defaults.initial_capital)?,
            overdraft: OverdraftPolicy::up_to(parse_or(&lookup, "ACCOUNT_OVERDRAFT_LIMIT", Money::ZERO)?),
            peers,
            settlement,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, Error>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, Error> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}

/// `abank=1000000.00,sbank=500000.00`. An empty value means no peers.
fn parse_peers(raw: &str) -> Result<Vec<PeerBank>, Error> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (code, capital) = entry
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("PEER_BANKS entry {:?} is not code=capital", entry)))?;
            let initial_capital = Money::from_str(capital).map_err(Error::Config)?;
            Ok(PeerBank {
                code: code.trim().to_owned(),
                initial_capital,
            })
        })
        .collect()
}
