use crate::domain::{DeadLetterQueue, Error, Operation};

#[derive(Default, Debug)]
pub struct StdErrDLQ {}

impl DeadLetterQueue for StdErrDLQ {
    fn report(&self, operation: Option<&Operation>, error: &Error) {
        match operation {
            Some(op) => eprintln!("DLQ Report - Operation: {} - Error: {}", op, error),
            None => eprintln!("DLQ Report - Error: {}", error),
        }
    }
}
