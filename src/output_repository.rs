use std::io::Write;

use serde::Serialize;

use crate::domain::{Account, AccountStatus, BankCapital, Error, Money, OutputRepository};

#[derive(Debug, Serialize)]
struct AccountRow {
    bank: String,
    account: String,
    client: String,
    currency: String,
    balance: Money,
    status: AccountStatus,
}

const ACCOUNT_HEADER: [&str; 6] = ["bank", "account", "client", "currency", "balance", "status"];
const CAPITAL_HEADER: [&str; 5] = [
    "bank_code",
    "initial_capital",
    "total_deposits",
    "total_loans",
    "capital",
];

/// Writes the end-of-run report as two CSV tables separated by a blank line:
/// accounts first, then bank capital.
#[derive(Debug)]
pub struct CsvOutput<W: Write> {
    out: W,
    accounts: Vec<AccountRow>,
    capital: Vec<BankCapital>,
}

impl CsvOutput<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> CsvOutput<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            accounts: Vec::new(),
            capital: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn writer(&mut self) -> csv::Writer<&mut W> {
        csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(&mut self.out)
    }
}

fn csv_error(e: csv::Error) -> Error {
    Error::Ingestion(format!("CSV serialization error: {}", e))
}

impl<W: Write> OutputRepository for CsvOutput<W> {
    fn write_accounts(&mut self, bank: &str, accounts: &[Account]) -> Result<(), Error> {
        self.accounts.extend(accounts.iter().map(|account| AccountRow {
            bank: bank.to_owned(),
            account: account.id.clone(),
            client: account.client_id.clone(),
            currency: account.currency.clone(),
            balance: account.balance,
            status: account.status,
        }));
        Ok(())
    }

    fn write_capital(&mut self, capital: &[BankCapital]) -> Result<(), Error> {
        self.capital.extend_from_slice(capital);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        let accounts = std::mem::take(&mut self.accounts);
        let capital = std::mem::take(&mut self.capital);

        let mut wtr = self.writer();
        wtr.write_record(ACCOUNT_HEADER).map_err(csv_error)?;
        for row in &accounts {
            wtr.serialize(row).map_err(csv_error)?;
        }
        wtr.flush()?;
        drop(wtr);
        writeln!(self.out)?;

        let mut wtr = self.writer();
        wtr.write_record(CAPITAL_HEADER).map_err(csv_error)?;
        for row in &capital {
            wtr.serialize(row).map_err(csv_error)?;
        }
        wtr.flush()?;
        drop(wtr);
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewAccount;

    #[test]
    fn prints_accounts_then_capital() {
        let mut account = Account::open(NewAccount::checking("acc-1", "cli-1", "RUB"));
        account.balance = Money(12_345);
        let capital = BankCapital::new("vbank", Money::from_major(1000));

        let mut output = CsvOutput::new(Vec::new());
        output.write_accounts("vbank", &[account]).unwrap();
        output.write_capital(&[capital]).unwrap();
        output.flush().unwrap();

        let text = String::from_utf8(output.into_inner()).unwrap();
        assert_eq!(
            text,
            "bank,account,client,currency,balance,status\n\
             vbank,acc-1,cli-1,RUB,123.45,active\n\
             \n\
             bank_code,initial_capital,total_deposits,total_loans,capital\n\
             vbank,1000.00,0.00,0.00,1000.00\n"
        );
    }
}
