//! Built-in fan-out sample: greet a fixed list of cities.
//!
//! The orchestrator schedules one greeting activity per city in a single
//! replay pass, joins the results, and returns them in input order as a JSON
//! array. Serves as the default workload registered by the server binary.
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::{
    ActivityContext, ActivityRegistryBuilder, OrchestrationRegistryBuilder,
};
use crate::OrchestrationContext;

pub const HELLO_ORCHESTRATION: &str = "HelloDurable";
pub const HELLO_ACTIVITY: &str = "HelloDurable_Hello";

/// Cities greeted by the sample, in output order.
pub const CITIES: [&str; 3] = ["Tokyo", "Seattle", "London"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GreetingInput {
    pub city_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GreetingOutput {
    /// Instance-scoped id stamped with the invocation time.
    pub id: String,
    pub name: String,
    pub message: String,
}

/// Fan out one greeting per city and fan the results back in. Completion
/// order does not affect the output: join yields results in schedule order.
pub async fn hello_cities(ctx: OrchestrationContext, _input: String) -> Result<String, String> {
    crate::durable_info!(ctx, "greeting {} cities", CITIES.len());
    let calls = CITIES
        .iter()
        .map(|city| {
            ctx.schedule_activity_typed(
                HELLO_ACTIVITY,
                &GreetingInput {
                    city_name: (*city).to_string(),
                },
            )
        })
        .collect();
    let results = ctx.join(calls).await;

    let mut outputs = Vec::with_capacity(results.len());
    for res in results {
        let raw = res?;
        let out: GreetingOutput = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
        outputs.push(out);
    }
    ctx.trace_info("all greetings collected");
    serde_json::to_string(&outputs).map_err(|e| e.to_string())
}

/// Greet a single city. Fails on an empty city name.
pub async fn say_hello(
    ctx: ActivityContext,
    input: GreetingInput,
) -> Result<GreetingOutput, String> {
    let city = input.city_name.trim();
    if city.is_empty() {
        return Err("city_name must not be empty".to_string());
    }
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    Ok(GreetingOutput {
        id: format!("{}_{}", ctx.instance, stamp),
        name: city.to_string(),
        message: format!("Hello from {city}!"),
    })
}

/// Add the sample orchestration to a registry builder.
pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder.register(HELLO_ORCHESTRATION, hello_cities)
}

/// Add the sample activity to a registry builder.
pub fn register_activities(builder: ActivityRegistryBuilder) -> ActivityRegistryBuilder {
    builder.register_typed(HELLO_ACTIVITY, say_hello)
}
