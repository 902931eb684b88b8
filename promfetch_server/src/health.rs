use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tide::{Request, Response, StatusCode};

/// Health reported on the health check port; degraded once shutdown begins.
#[derive(Clone, Debug, Default)]
pub struct Health {
    degraded: Arc<AtomicBool>,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn degrade(&self) {
        self.degraded.store(true, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        !self.degraded.load(Ordering::SeqCst)
    }
}

pub fn server(health: Health) -> tide::Server<Health> {
    let mut app = tide::with_state(health);
    app.at("/").get(check);
    app.at("/*").get(check);
    app
}

async fn check(req: Request<Health>) -> tide::Result {
    if req.state().is_healthy() {
        Ok(Response::builder(StatusCode::Ok).body("ok").build())
    } else {
        Ok(Response::builder(StatusCode::ServiceUnavailable)
            .body("degraded")
            .build())
    }
}
