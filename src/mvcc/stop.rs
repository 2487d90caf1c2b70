// Copyright 2015 The etcd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future;

use tokio::sync::watch;

// channel creates a connected stop pair. The store keeps the Stopper and
// hands a StopSignal to each background task it starts.
pub fn channel() -> (Stopper, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (Stopper { tx }, StopSignal { rx })
}

#[derive(Debug)]
pub struct Stopper {
    tx: watch::Sender<bool>,
}

impl Stopper {
    // stop signals every StopSignal of this pair. Calling it more than once
    // has no further effect.
    pub fn stop(&self) {
        self.tx.send_if_modified(|stopped| !std::mem::replace(stopped, true));
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal { rx: self.tx.subscribe() }
    }
}

#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    // stopped resolves once stop has been called. If the Stopper goes away
    // without stopping, the signal can never fire and stopped stays pending.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                future::pending::<()>().await;
            }
        }
    }
}
