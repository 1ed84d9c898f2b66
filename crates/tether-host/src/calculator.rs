//! Demo calculator service.
//!
//! Keeps a running total per instance and reports every change to the
//! client through the `Changed` event.

use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use tether_core::{
    Access, CallContext, ContractError, EventRaiser, InstanceContext, ReturnShape, ServiceBinding,
    ServiceContract,
};

pub const NAMESPACE: &str = "demo";
pub const TYPE_NAME: &str = "Calculator";

pub mod keys {
    use tether_core::MethodKey;

    pub const ADD: MethodKey = 1;
    pub const SUBTRACT: MethodKey = 2;
    pub const DIVIDE: MethodKey = 3;
    pub const TOTAL: MethodKey = 4;
    pub const ACCUMULATE: MethodKey = 5;
    pub const RESET: MethodKey = 6;
    pub const GREET: MethodKey = 7;
    pub const WHOAMI: MethodKey = 8;
    pub const CHANGED: (MethodKey, MethodKey) = (20, 21);
    pub const GREETED: (MethodKey, MethodKey) = (22, 23);
}

/// Shared interface description; clients build their proxies from it too.
pub fn contract() -> Result<ServiceContract, ContractError> {
    ServiceContract::builder(NAMESPACE, TYPE_NAME)
        .version(1)
        .method(keys::ADD, "Add", &[("a", "i32"), ("b", "i32")], ReturnShape::Value)
        .method(keys::SUBTRACT, "Subtract", &[("a", "i32"), ("b", "i32")], ReturnShape::Value)
        .method(keys::DIVIDE, "Divide", &[("a", "f64"), ("b", "f64")], ReturnShape::Value)
        .method(keys::TOTAL, "Total", &[], ReturnShape::Value)
        .method(keys::ACCUMULATE, "Accumulate", &[("n", "i64")], ReturnShape::Value)
        .method(keys::RESET, "Reset", &[], ReturnShape::AsyncVoid)
        .access(Access::Authenticated)
        .method(keys::GREET, "Greet", &[("name", "string")], ReturnShape::Async)
        .method(keys::WHOAMI, "WhoAmI", &[], ReturnShape::Value)
        .event("Changed", keys::CHANGED, &[("total", "i64")], true, ReturnShape::Value)
        .event("Greeted", keys::GREETED, &[("name", "string")], false, ReturnShape::Void)
        .build()
}

pub struct Calculator {
    total: Mutex<i64>,
    events: EventRaiser,
}

impl Calculator {
    pub fn new(ctx: InstanceContext) -> Self {
        Self {
            total: Mutex::new(0),
            events: ctx.events,
        }
    }

    fn total(&self) -> i64 {
        *self.total.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add to the running total; resolves to the client's acknowledgement.
    async fn accumulate(&self, n: i64) -> anyhow::Result<Option<bool>> {
        let total = {
            let mut total = self.total.lock().unwrap_or_else(PoisonError::into_inner);
            *total += n;
            *total
        };
        Ok(self.events.raise_as::<bool>("Changed", vec![json!(total)]).await?)
    }

    fn reset(&self) {
        *self.total.lock().unwrap_or_else(PoisonError::into_inner) = 0;
    }

    async fn greet(&self, name: String) -> anyhow::Result<String> {
        self.events.raise("Greeted", vec![json!(name)]).await?;
        Ok(format!("Hello, {}!", name))
    }
}

/// Bind the calculator contract to its implementation.
pub fn binding() -> Result<ServiceBinding, ContractError> {
    ServiceBinding::builder(contract()?, |ctx: InstanceContext| Calculator::new(ctx))
        .method(keys::ADD, |_svc: Arc<Calculator>, _ctx: CallContext, (a, b): (i32, i32)| async move {
            Ok(a + b)
        })
        .method(keys::SUBTRACT, |_svc: Arc<Calculator>, _ctx: CallContext, (a, b): (i32, i32)| async move {
            Ok(a - b)
        })
        .method(keys::DIVIDE, |_svc: Arc<Calculator>, _ctx: CallContext, (a, b): (f64, f64)| async move {
            if b == 0.0 {
                anyhow::bail!("division by zero");
            }
            Ok(a / b)
        })
        .method(keys::TOTAL, |svc: Arc<Calculator>, _ctx: CallContext, (): ()| async move {
            Ok(svc.total())
        })
        .method(keys::ACCUMULATE, |svc: Arc<Calculator>, _ctx: CallContext, (n,): (i64,)| async move {
            svc.accumulate(n).await
        })
        .method(keys::RESET, |svc: Arc<Calculator>, _ctx: CallContext, (): ()| async move {
            svc.reset();
            Ok(())
        })
        .method(keys::GREET, |svc: Arc<Calculator>, _ctx: CallContext, (name,): (String,)| async move {
            svc.greet(name).await
        })
        .method(keys::WHOAMI, |_svc: Arc<Calculator>, ctx: CallContext, (): ()| async move {
            Ok(ctx.identity.name)
        })
        .build()
}
