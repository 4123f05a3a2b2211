use std::io::Read;
use std::pin::Pin;

use futures::stream::{self, Stream};
use serde::Deserialize;

use crate::domain::{Error, Money, Operation, OperationKind, OperationStream};

pub struct CsvReader<R: Read> {
    reader: Option<csv::Reader<R>>,
    default_bank: String,
}

impl<R: Read> CsvReader<R> {
    /// Rows with an empty `bank` column are attributed to `default_bank`.
    pub fn new(reader: R, default_bank: impl Into<String>) -> Result<Self, Error> {
        let rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        Ok(Self {
            reader: Some(rdr),
            default_bank: default_bank.into(),
        })
    }
}

/// Internal shape used only for CSV deserialization.
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    bank: Option<String>,
    account: String,
    #[serde(default)]
    client: Option<String>,
    #[serde(default)]
    to_bank: Option<String>,
    #[serde(default)]
    to_account: Option<String>,
    #[serde(default)]
    amount: Option<Money>,
    #[serde(default)]
    id: Option<String>,
}

fn present(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.is_empty())
}

impl CsvRow {
    fn into_operation(self, default_bank: &str) -> Result<Operation, Error> {
        let kind_name = self.kind.to_ascii_lowercase();
        let missing = |field: &str| {
            Error::Ingestion(format!("{} for {} is missing `{}`", kind_name, self.account, field))
        };

        let kind = match (kind_name.as_str(), self.amount) {
            ("open", amount) => OperationKind::Open {
                client: present(self.client.clone()).ok_or_else(|| missing("client"))?,
                opening_balance: amount.unwrap_or(Money::ZERO),
            },
            ("deposit", Some(amount)) => OperationKind::Deposit { amount },
            ("withdrawal", Some(amount)) => OperationKind::Withdrawal { amount },
            ("transfer", Some(amount)) => OperationKind::Transfer {
                to_bank: present(self.to_bank.clone()),
                to_account: present(self.to_account.clone()).ok_or_else(|| missing("to_account"))?,
                amount,
            },
            ("loan", Some(amount)) => OperationKind::Loan { amount },
            ("repay", Some(amount)) => OperationKind::Repay { amount },
            ("freeze", None) => OperationKind::Freeze,
            ("unfreeze", None) => OperationKind::Unfreeze,
            ("close", None) => OperationKind::Close {
                sweep_to: present(self.to_account.clone()),
            },
            ("deposit" | "withdrawal" | "transfer" | "loan" | "repay", None) => {
                return Err(missing("amount"));
            }
            (other, _) => {
                return Err(Error::Ingestion(format!("Invalid operation type: {}", other)));
            }
        };

        Ok(Operation {
            kind,
            bank: present(self.bank).unwrap_or_else(|| default_bank.to_owned()),
            account: self.account,
            id: present(self.id),
        })
    }
}

impl<R: Read + Send + 'static> OperationStream for CsvReader<R> {
    type OpStream = Pin<Box<dyn Stream<Item = Result<Operation, Error>> + Send>>;

    fn stream(&mut self) -> Self::OpStream {
        let reader = match self.reader.take() {
            Some(r) => r,
            None => {
                // Already consumed; return an empty stream.
                return Box::pin(stream::iter(Vec::<Result<Operation, Error>>::new()));
            }
        };
        let default_bank = self.default_bank.clone();

        let iter = reader
            .into_deserialize::<CsvRow>()
            .map(move |row_res| match row_res {
                Ok(row) => row.into_operation(&default_bank),
                Err(e) => Err(Error::Ingestion(format!(
                    "CSV deserialization error: {}",
                    e
                ))),
            });

        Box::pin(stream::iter(iter))
    }
}
