//! Query commands: read-only snapshots of the agent and world. Never touch
//! the execution engine.

use std::future::Future;
use std::sync::Arc;

use super::{Arg, CommandError, CommandRegistry, CommandSpec, Handler};
use crate::agent::Agent;

fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Agent>, Vec<Arg>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
{
    Arc::new(move |agent, args| Box::pin(f(agent, args)))
}

fn query(name: &'static str, description: &'static str, handler: Handler) -> CommandSpec {
    CommandSpec {
        name,
        description,
        params: vec![],
        format: None,
        action: false,
        handler,
    }
}

pub fn register_all(registry: &mut CommandRegistry) -> Result<(), CommandError> {
    for spec in [stats(), inventory(), entities(), modes(), saved_places()] {
        registry.register(spec)?;
    }
    Ok(())
}

fn stats() -> CommandSpec {
    query(
        "!stats",
        "Get your bot's location, health, hunger, and time of day.",
        handler(|agent, _args| async move {
            let stats = agent.world.stats().await?;
            let mut out = String::from("STATS");
            out.push_str(&format!(
                "\n- Position: x: {:.2}, y: {:.2}, z: {:.2}",
                stats.position.x, stats.position.y, stats.position.z
            ));
            out.push_str(&format!("\n- Health: {:.0} / 20", stats.health));
            out.push_str(&format!("\n- Hunger: {:.0} / 20", stats.food));
            out.push_str(&format!("\n- Time of day: {}", stats.time_of_day));
            if let Some(weather) = &stats.weather {
                out.push_str(&format!("\n- Weather: {weather}"));
            }
            if agent.recently_damaged(std::time::Duration::from_secs(10)) {
                out.push_str(&format!(
                    "\n- Recently hurt: lost {:.0} HP",
                    agent.last_damage_taken()
                ));
            }
            Ok(Some(out))
        }),
    )
}

fn inventory() -> CommandSpec {
    query(
        "!inventory",
        "Get your bot's inventory.",
        handler(|agent, _args| async move {
            let items = agent.world.inventory().await?;
            if items.is_empty() {
                return Ok(Some("INVENTORY: none".to_string()));
            }
            let mut out = String::from("INVENTORY");
            for stack in items {
                out.push_str(&format!("\n- {}: {}", stack.name, stack.count));
            }
            Ok(Some(out))
        }),
    )
}

fn entities() -> CommandSpec {
    query(
        "!entities",
        "Get a list of nearby players and entities.",
        handler(|agent, _args| async move {
            let nearby = agent.world.nearby_entities().await?;
            if nearby.is_empty() {
                return Ok(Some("NEARBY ENTITIES: none".to_string()));
            }
            let mut out = String::from("NEARBY ENTITIES");
            for entity in nearby {
                out.push_str(&format!("\n- {entity}"));
            }
            Ok(Some(out))
        }),
    )
}

fn modes() -> CommandSpec {
    query(
        "!modes",
        "Get all available modes and their docs and see which are on/off.",
        handler(|agent, _args| async move { Ok(Some(agent.modes.docs())) }),
    )
}

fn saved_places() -> CommandSpec {
    query(
        "!savedPlaces",
        "List all saved locations.",
        handler(|agent, _args| async move {
            let names: Vec<String> = agent.places.lock().unwrap().keys().cloned().collect();
            if names.is_empty() {
                return Ok(Some("No locations saved.".to_string()));
            }
            Ok(Some(format!("SAVED PLACES: {}", names.join(", "))))
        }),
    )
}
