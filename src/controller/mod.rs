//! Controller implementation for the Coroot CRD

mod coroot;

pub use coroot::{
    error_policy, reconcile, reconcile_key, Context, InstanceClient, InstanceClientImpl,
    MISCONFIGURED_RECHECK_INTERVAL, RECONCILE_TIMEOUT,
};
