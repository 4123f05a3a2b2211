use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Metadata, PeerError, SettlementInstruction, SettlementPeer, SettlementReceipt};
use crate::ledger::LedgerStore;

/// A peer bank living in this process with its own ledger. The sandbox runs
/// the other banks this way.
#[derive(Debug, Clone)]
pub struct LocalPeer {
    bank_code: String,
    ledger: Arc<LedgerStore>,
}

impl LocalPeer {
    pub fn new(bank_code: impl Into<String>, ledger: Arc<LedgerStore>) -> Self {
        Self {
            bank_code: bank_code.into(),
            ledger,
        }
    }
}

#[async_trait]
impl SettlementPeer for LocalPeer {
    fn bank_code(&self) -> &str {
        &self.bank_code
    }

    async fn credit(
        &self,
        instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, PeerError> {
        // transfer_id as reference makes replays return the first credit
        let meta = Metadata::reference(instruction.transfer_id.clone())
            .with_counterparty(format!(
                "{}/{}",
                instruction.from_bank, instruction.from_account
            ))
            .with_description("interbank transfer")
            .with_currency(instruction.currency.clone());

        let tx = self
            .ledger
            .credit(&instruction.to_account, instruction.amount, meta)
            .await
            .map_err(|e| PeerError::Rejected(e.to_string()))?;

        tracing::debug!(
            bank = %self.bank_code,
            transfer_id = %instruction.transfer_id,
            tx = %tx.transaction_id,
            "credited incoming transfer"
        );
        Ok(SettlementReceipt {
            transfer_id: instruction.transfer_id.clone(),
            remote_tx: tx.transaction_id,
        })
    }
}
