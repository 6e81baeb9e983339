//! End-to-end scenarios through the [`Dispatcher`](crate::Dispatcher),
//! driven by scripted fakes on a paused clock.

pub(crate) mod fakes;

mod background;

use std::sync::Arc;

use crate::config::{Credentials, GateConfig};
use crate::Dispatcher;
use fakes::{ScriptedAuth, ScriptedRemote};

pub(crate) struct Harness {
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) remote: Arc<ScriptedRemote>,
    pub(crate) auth: Arc<ScriptedAuth>,
}

pub(crate) fn config() -> GateConfig {
    GateConfig {
        credentials: Credentials::new("user", "pw", "app-key"),
        ..Default::default()
    }
}

pub(crate) fn harness(config: GateConfig) -> Harness {
    let remote = Arc::new(ScriptedRemote::new());
    let auth = Arc::new(ScriptedAuth::new());
    let dispatcher = Arc::new(
        Dispatcher::new(&config, remote.clone(), auth.clone()).expect("valid test config"),
    );
    Harness {
        dispatcher,
        remote,
        auth,
    }
}
