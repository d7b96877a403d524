//! Shared harness: in-memory store, seeded hierarchy, simulated vendor
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use latch_gateway::adapters::SimAdapter;
use latch_gateway::db;
use latch_gateway::model::{
    Attachment, Device, DeviceKind, LockState, Portfolio, Property, Role, Scope, Unit,
};
use latch_gateway::{AdapterRegistry, DispatchConfig, Gateway, RetryPolicy};

pub struct Harness {
    pub gateway: Gateway,
    pub sim: Arc<SimAdapter>,
}

/// Dispatch config with millisecond backoff so retry tests stay fast
pub fn fast_config() -> DispatchConfig {
    DispatchConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        call_deadline: Duration::from_secs(2),
        ..DispatchConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(fast_config()).await
}

/// Build a gateway over an in-memory store with the seeded hierarchy
///
/// Layout: portfolio `pf-1` holds `prop-1` (units `u1`, `u2`, plus the
/// property-level device `d3`) and `prop-2` (unit `u3`). One lock per
/// unit: `d1` in `u1`, `d2` in `u2`, `d4` in `u3`.
///
/// Actors: `olivia` owns `pf-1`, `ada` is portfolio admin, `pam` manages
/// `prop-1`, `eve` is tenant of `u1`.
pub async fn harness_with(config: DispatchConfig) -> Harness {
    let pool = db::init_memory().expect("in-memory db");
    let sim = Arc::new(SimAdapter::new("sim"));
    let mut registry = AdapterRegistry::new();
    registry.register(sim.clone());
    let gateway = Gateway::new(pool, registry, config);

    let entities = gateway.entities();
    entities
        .create_portfolio(&Portfolio {
            id: "pf-1".into(),
            name: "North Holdings".into(),
        })
        .unwrap();
    for (id, name) in [("prop-1", "Birch Street"), ("prop-2", "Cedar Row")] {
        entities
            .create_property(&Property {
                id: id.into(),
                name: name.into(),
                portfolio_id: "pf-1".into(),
            })
            .unwrap();
    }
    for (id, property) in [("u1", "prop-1"), ("u2", "prop-1"), ("u3", "prop-2")] {
        entities
            .create_unit(&Unit {
                id: id.into(),
                name: format!("Unit {id}"),
                property_id: property.into(),
            })
            .unwrap();
    }
    for (id, attachment) in [
        ("d1", Attachment::Unit("u1".into())),
        ("d2", Attachment::Unit("u2".into())),
        ("d3", Attachment::Property("prop-1".into())),
        ("d4", Attachment::Unit("u3".into())),
    ] {
        entities
            .create_device(&Device {
                id: id.into(),
                name: format!("Lock {id}"),
                vendor: "sim".into(),
                kind: DeviceKind::Lock,
                attachment,
                is_online: true,
                remote_operation_enabled: true,
            })
            .unwrap();
        sim.add_device(id, LockState::Locked).await;
    }

    gateway
        .bootstrap_owner("olivia", &Scope::Portfolio("pf-1".into()))
        .unwrap();
    gateway
        .grant_role(
            "olivia",
            "ada",
            &Scope::Portfolio("pf-1".into()),
            Role::PortfolioAdmin,
        )
        .unwrap();
    gateway
        .grant_role(
            "olivia",
            "pam",
            &Scope::Property("prop-1".into()),
            Role::PropertyManager,
        )
        .unwrap();
    gateway
        .grant_role("olivia", "eve", &Scope::Unit("u1".into()), Role::Tenant)
        .unwrap();

    Harness { gateway, sim }
}
