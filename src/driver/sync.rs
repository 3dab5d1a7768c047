use std::task::Poll;

use super::{Drive, Work};
use crate::slot::Outcome;
use crate::Error;

/// No concurrency: `spawn` runs the work before returning, so there is
/// nothing to wait for afterwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncDriver;

impl Drive for SyncDriver {
    fn spawn(&self, work: Work) -> Result<(), Error> {
        work();
        Ok(())
    }

    fn wait(&self) -> Result<Option<Outcome>, Error> {
        Ok(None)
    }

    fn notify(&self, _outcome: &Outcome) -> Result<(), Error> {
        Ok(())
    }

    fn poll(&self) -> Result<Poll<Option<Outcome>>, Error> {
        Ok(Poll::Ready(None))
    }
}
