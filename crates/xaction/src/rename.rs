//! Two-phase bucket rename. The *begin* phase creates the xaction and
//! kicks off rebalance of the bucket's objects; *commit* advances the
//! same instance, which then waits for the rebalance generation to
//! drain before the bucket switch becomes final.

use crate::base::{Kind, Xact, XactBase};
use crate::registry::{Registry, RenewDecision, XactProvider};
use crate::{Error, Result};
use cluster::Bck;
use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const REBALANCE_POLL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Begin,
    Commit,
}

#[derive(Debug, Clone)]
pub struct MoveBckArgs {
    pub bck_from: Bck,
    pub bck_to: Bck,
    pub phase: Phase,
    pub rebalance_id: String,
}

pub struct MoveBckXact {
    base: XactBase,
    pub bck_from: Bck,
    pub bck_to: Bck,
    pub rebalance_id: String,
    phase: Mutex<Phase>,
}

impl MoveBckXact {
    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    fn advance(&self) {
        let mut phase = self.phase.lock().unwrap();
        *phase = Phase::Commit;
    }

    /// Commit-side wait: poll until every rebalance xaction of our
    /// generation is finished, observing our own abort.
    pub async fn wait_rebalance(&self, reg: &Registry, poll: Duration) -> Result<()> {
        let mut abort = self.base.abort_watch();
        tokio::select! {
            _ = reg.wait_rebalance_done(&self.rebalance_id, poll) => Ok(()),
            _ = abort.wait_for(|aborted| *aborted) => {
                Err(Error::Aborted(self.base.id.clone()))
            }
        }
    }
}

impl Xact for MoveBckXact {
    fn base(&self) -> &XactBase {
        &self.base
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub struct MoveBckProvider {
    pub args: MoveBckArgs,
}

impl MoveBckProvider {
    pub fn new(args: MoveBckArgs) -> Arc<MoveBckProvider> {
        Arc::new(MoveBckProvider { args })
    }
}

impl XactProvider for MoveBckProvider {
    fn kind(&self) -> Kind {
        Kind::MoveBck
    }

    fn pre_renew_hook(&self, prev: &Arc<dyn Xact>) -> RenewDecision {
        let Some(prev) = prev.as_any().downcast_ref::<MoveBckXact>() else {
            return RenewDecision::Refuse(Error::Usage(
                "previous move-bck xaction has unexpected type".to_string(),
            ));
        };
        match self.args.phase {
            // A second begin on a live rename is a caller bug.
            Phase::Begin => RenewDecision::Refuse(Error::AlreadyRunning {
                kind: Kind::MoveBck,
                bck: self.args.bck_from.uname(),
            }),
            Phase::Commit => {
                if prev.bck_from == self.args.bck_from && prev.bck_to == self.args.bck_to {
                    prev.advance();
                    RenewDecision::Keep
                } else {
                    RenewDecision::Refuse(Error::RenameMismatch {
                        got_from: self.args.bck_from.uname(),
                        got_to: self.args.bck_to.uname(),
                        want_from: prev.bck_from.uname(),
                        want_to: prev.bck_to.uname(),
                    })
                }
            }
        }
    }

    fn start(&self, _bck: Option<&Bck>) -> Result<Arc<dyn Xact>> {
        if self.args.phase == Phase::Commit {
            // Commit without a live begin: nothing to advance.
            return Err(Error::Usage(format!(
                "commit of {} => {} has no begin phase to complete",
                self.args.bck_from.uname(),
                self.args.bck_to.uname()
            )));
        }
        Ok(Arc::new(MoveBckXact {
            base: XactBase::new(Kind::MoveBck, Some(self.args.bck_from.clone())),
            bck_from: self.args.bck_from.clone(),
            bck_to: self.args.bck_to.clone(),
            rebalance_id: self.args.rebalance_id.clone(),
            phase: Mutex::new(Phase::Begin),
        }))
    }
}
