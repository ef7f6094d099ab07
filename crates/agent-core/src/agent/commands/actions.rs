//! Action commands: world-mutating behaviors dispatched through the
//! execution engine, plus the control commands that manage the engine, the
//! self-prompt loop, and the agent process itself.

use std::future::Future;
use std::sync::Arc;

use super::{Arg, ArgType, CommandError, CommandRegistry, CommandSpec, Handler, ParamSpec};
use crate::agent::coder::Work;
use crate::agent::script;
use crate::agent::{Agent, ShutdownReason};
use crate::world::WorldApi;

fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Agent>, Vec<Arg>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
{
    Arc::new(move |agent, args| Box::pin(f(agent, args)))
}

/// Runs `work` through the engine and applies the shared reporting contract:
/// a purely interrupted completion (no timeout) produces no user-facing text.
async fn run_action(agent: &Agent, resume: bool, timeout_mins: i64, work: Work) -> Option<String> {
    let result = if resume {
        agent.coder.execute_resume(work, timeout_mins).await
    } else {
        agent.coder.execute(work, timeout_mins).await
    };
    if result.interrupted && !result.timed_out {
        return None;
    }
    result.message
}

/// Wraps a single world primitive as cancellable engine work.
fn world_work<F, Fut>(world: Arc<dyn WorldApi>, f: F) -> Work
where
    F: Fn(Arc<dyn WorldApi>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    Arc::new(move |sig| {
        let fut = f(world.clone());
        Box::pin(async move { sig.race(fut).await })
    })
}

pub fn register_all(registry: &mut CommandRegistry) -> Result<(), CommandError> {
    for spec in [
        new_action(),
        stop(),
        stfu(),
        restart(),
        clear_chat(),
        go_to_player(),
        follow_player(),
        go_to_block(),
        move_away(),
        remember_here(),
        go_to_place(),
        give_player(),
        consume(),
        equip(),
        put_in_chest(),
        take_from_chest(),
        view_chest(),
        discard(),
        collect_blocks(),
        collect_all_blocks(),
        craft_recipe(),
        smelt_item(),
        clear_furnace(),
        place_here(),
        attack(),
        go_to_bed(),
        stay(),
        set_mode(),
        goal(),
        end_goal(),
    ] {
        registry.register(spec)?;
    }
    Ok(())
}

fn new_action() -> CommandSpec {
    CommandSpec {
        name: "!newAction",
        description: "Perform new and unknown custom behaviors that are not available as a command.",
        params: vec![ParamSpec::new(
            "prompt",
            ArgType::Str,
            "A natural language prompt to guide the generated steps. Make a detailed step-by-step plan.",
        )],
        format: None,
        action: true,
        handler: handler(|agent, _args| async move {
            // The prompt argument is ignored here; the triggering message is
            // already in history and gives the generation its context.
            if !agent.settings.allow_custom_actions {
                return Ok(Some(
                    "newAction not allowed! Custom action generation is disabled in settings. Notify the user."
                        .to_string(),
                ));
            }
            let steps = {
                let _generating = agent.coder.begin_generation();
                let turns = agent.history.lock().await.turns();
                script::generate_steps(agent.model.as_ref(), turns).await?
            };
            let work = script::steps_into_work(steps, agent.world.clone());
            Ok(run_action(&agent, false, agent.settings.action_timeout_mins, work).await)
        }),
    }
}

fn stop() -> CommandSpec {
    CommandSpec {
        name: "!stop",
        description: "Force stop all actions and commands that are currently executing.",
        params: vec![],
        format: None,
        action: true,
        handler: handler(|agent, _args| async move {
            agent.coder.stop().await;
            agent.coder.clear();
            agent.modes.unpause_all();
            let mut msg = "Agent stopped.".to_string();
            if agent.self_prompter.is_on() {
                msg.push_str(" Self-prompting still active.");
            }
            Ok(Some(msg))
        }),
    }
}

fn stfu() -> CommandSpec {
    CommandSpec {
        name: "!stfu",
        description: "Stop all chatting and self prompting, but continue current action.",
        params: vec![],
        format: None,
        action: true,
        handler: handler(|agent, _args| async move {
            agent.world.chat("Shutting up.").await?;
            agent.shut_up();
            Ok(None)
        }),
    }
}

fn restart() -> CommandSpec {
    CommandSpec {
        name: "!restart",
        description: "Restart the agent process.",
        params: vec![],
        format: None,
        action: true,
        handler: handler(|agent, _args| async move {
            agent.save_history().await;
            agent
                .clean_kill(ShutdownReason::Requested, "Restart requested.")
                .await;
            Ok(None)
        }),
    }
}

fn clear_chat() -> CommandSpec {
    CommandSpec {
        name: "!clearChat",
        description: "Clear the chat history.",
        params: vec![],
        format: None,
        action: true,
        handler: handler(|agent, _args| async move {
            agent.history.lock().await.clear();
            Ok(Some(format!(
                "{}'s chat history was cleared, starting new conversation from scratch.",
                agent.name
            )))
        }),
    }
}

fn go_to_player() -> CommandSpec {
    CommandSpec {
        name: "!goToPlayer",
        description: "Go to the given player.",
        params: vec![
            ParamSpec::new("player_name", ArgType::Str, "The name of the player to go to."),
            ParamSpec::new("closeness", ArgType::Float, "How close to get to the player.")
                .domain(0.0, f64::INFINITY)
                .abs(),
        ],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let player = args[0].str()?.to_string();
            let closeness = args[1].float()?;
            let work = world_work(agent.world.clone(), move |world| {
                let player = player.clone();
                async move { world.go_to_player(&player, closeness).await }
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn follow_player() -> CommandSpec {
    CommandSpec {
        name: "!followPlayer",
        description: "Endlessly follow the given player. Will defend that player if self_defense mode is on.",
        params: vec![
            ParamSpec::new("player_name", ArgType::Str, "Name of the player to follow."),
            ParamSpec::new("follow_dist", ArgType::Float, "The distance to follow from.")
                .domain(0.0, f64::INFINITY)
                .abs(),
        ],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let player = args[0].str()?.to_string();
            let dist = args[1].float()?;
            let work = world_work(agent.world.clone(), move |world| {
                let player = player.clone();
                async move { world.follow_player(&player, dist).await }
            });
            Ok(run_action(&agent, true, -1, work).await)
        }),
    }
}

fn go_to_block() -> CommandSpec {
    CommandSpec {
        name: "!goToBlock",
        description: "Go to the nearest block of a given type.",
        params: vec![
            ParamSpec::new("type", ArgType::BlockName, "The block type to go to."),
            ParamSpec::new("closeness", ArgType::Float, "How close to get to the block.")
                .domain(0.0, f64::INFINITY)
                .abs(),
            ParamSpec::new(
                "search_range",
                ArgType::Float,
                "The distance to search for the block.",
            )
            .domain(0.0, f64::INFINITY)
            .abs(),
        ],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let block = args[0].str()?.to_string();
            let closeness = args[1].float()?;
            let range = args[2].float()?;
            let work = world_work(agent.world.clone(), move |world| {
                let block = block.clone();
                async move { world.go_to_block(&block, closeness, range).await }
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn move_away() -> CommandSpec {
    CommandSpec {
        name: "!moveAway",
        description: "Move away from the current location in any direction by a given distance.",
        params: vec![ParamSpec::new(
            "distance",
            ArgType::Float,
            "The distance to move away.",
        )
        .domain(0.0, f64::INFINITY)
        .abs()],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let distance = args[0].float()?;
            let work = world_work(agent.world.clone(), move |world| async move {
                world.move_away(distance).await
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn remember_here() -> CommandSpec {
    CommandSpec {
        name: "!rememberHere",
        description: "Save the current location with a given name.",
        params: vec![ParamSpec::new(
            "name",
            ArgType::Str,
            "The name to remember the location as.",
        )],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let name = args[0].str()?.to_string();
            // Coordinates are stored as-is; negative values are valid here.
            let pos = agent.world.position().await?;
            agent.places.lock().unwrap().insert(name.clone(), pos);
            Ok(Some(format!("Location saved as \"{name}\".")))
        }),
    }
}

fn go_to_place() -> CommandSpec {
    CommandSpec {
        name: "!goToPlace",
        description: "Go to a saved location.",
        params: vec![ParamSpec::new(
            "name",
            ArgType::Str,
            "The name of the location to go to.",
        )],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let name = args[0].str()?.to_string();
            let place = agent.places.lock().unwrap().get(&name).copied();
            let world = agent.world.clone();
            let work: Work = Arc::new(move |sig| {
                let world = world.clone();
                let name = name.clone();
                Box::pin(async move {
                    match place {
                        None => Ok(Some(format!("No location named \"{name}\" saved."))),
                        Some(pos) => sig.race(world.go_to_position(pos, 1.0)).await,
                    }
                })
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn give_player() -> CommandSpec {
    CommandSpec {
        name: "!givePlayer",
        description: "Give the specified item to the given player.",
        params: vec![
            ParamSpec::new(
                "player_name",
                ArgType::Str,
                "The name of the player to give the item to.",
            ),
            ParamSpec::new("item_name", ArgType::ItemName, "The name of the item to give."),
            ParamSpec::new("num", ArgType::Int, "The number of items to give.")
                .domain(1.0, f64::INFINITY)
                .abs(),
        ],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let player = args[0].str()?.to_string();
            let item = args[1].str()?.to_string();
            let num = args[2].count()?;
            let work = world_work(agent.world.clone(), move |world| {
                let player = player.clone();
                let item = item.clone();
                async move { world.give_to_player(&item, &player, num).await }
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn consume() -> CommandSpec {
    CommandSpec {
        name: "!consume",
        description: "Eat/drink the given item.",
        params: vec![ParamSpec::new(
            "item_name",
            ArgType::ItemName,
            "The name of the item to consume.",
        )],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let item = args[0].str()?.to_string();
            let work = world_work(agent.world.clone(), move |world| {
                let item = item.clone();
                async move { world.consume(&item).await }
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn equip() -> CommandSpec {
    CommandSpec {
        name: "!equip",
        description: "Equip the given item.",
        params: vec![ParamSpec::new(
            "item_name",
            ArgType::ItemName,
            "The name of the item to equip.",
        )],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let item = args[0].str()?.to_string();
            let work = world_work(agent.world.clone(), move |world| {
                let item = item.clone();
                async move { world.equip(&item).await }
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn put_in_chest() -> CommandSpec {
    CommandSpec {
        name: "!putInChest",
        description: "Put the given item in the nearest chest.",
        params: vec![
            ParamSpec::new(
                "item_name",
                ArgType::ItemName,
                "The name of the item to put in the chest.",
            ),
            ParamSpec::new("num", ArgType::Int, "The number of items to put in the chest.")
                .domain(1.0, f64::INFINITY)
                .abs(),
        ],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let item = args[0].str()?.to_string();
            let num = args[1].count()?;
            let work = world_work(agent.world.clone(), move |world| {
                let item = item.clone();
                async move { world.put_in_chest(&item, num).await }
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn take_from_chest() -> CommandSpec {
    CommandSpec {
        name: "!takeFromChest",
        description: "Take the given items from the nearest chest.",
        params: vec![
            ParamSpec::new("item_name", ArgType::ItemName, "The name of the item to take."),
            ParamSpec::new("num", ArgType::Int, "The number of items to take.")
                .domain(1.0, f64::INFINITY)
                .abs(),
        ],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let item = args[0].str()?.to_string();
            let num = args[1].count()?;
            let work = world_work(agent.world.clone(), move |world| {
                let item = item.clone();
                async move { world.take_from_chest(&item, num).await }
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn view_chest() -> CommandSpec {
    CommandSpec {
        name: "!viewChest",
        description: "View the items/counts of the nearest chest.",
        params: vec![],
        format: None,
        action: true,
        handler: handler(|agent, _args| async move {
            let work = world_work(agent.world.clone(), |world| async move {
                world.view_chest().await
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn discard() -> CommandSpec {
    CommandSpec {
        name: "!discard",
        description: "Discard the given item from the inventory.",
        params: vec![
            ParamSpec::new(
                "item_name",
                ArgType::ItemName,
                "The name of the item to discard.",
            ),
            ParamSpec::new("num", ArgType::Int, "The number of items to discard.")
                .domain(1.0, f64::INFINITY)
                .abs(),
        ],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let item = args[0].str()?.to_string();
            let num = args[1].count()?;
            let world = agent.world.clone();
            // Step away before dropping so nothing lands on the agent, then
            // walk back to where it started.
            let work: Work = Arc::new(move |mut sig| {
                let world = world.clone();
                let item = item.clone();
                Box::pin(async move {
                    let Some(start) = sig.race(world.position()).await? else {
                        return Ok(None);
                    };
                    if sig.race(world.move_away(5.0)).await?.is_none() {
                        return Ok(None);
                    }
                    sig.checkpoint().await?;
                    let Some(message) = sig.race(world.discard(&item, num)).await? else {
                        return Ok(None);
                    };
                    sig.checkpoint().await?;
                    if sig.race(world.go_to_position(start, 0.0)).await?.is_none() {
                        return Ok(None);
                    }
                    Ok(Some(message))
                })
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn collect_blocks() -> CommandSpec {
    CommandSpec {
        name: "!collectBlocks",
        description: "Collect the nearest blocks of a given type.",
        params: vec![
            ParamSpec::new("type", ArgType::BlockName, "The block type to collect."),
            ParamSpec::new("num", ArgType::Int, "The number of blocks to collect.")
                .domain(1.0, f64::INFINITY)
                .abs(),
        ],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let block = args[0].str()?.to_string();
            let num = args[1].count()?;
            let world = agent.world.clone();
            let work: Work = Arc::new(move |sig| {
                let world = world.clone();
                let block = block.clone();
                Box::pin(async move {
                    let Some(found) = sig.race(world.collect_block(&block, num)).await? else {
                        return Ok(None);
                    };
                    Ok(Some(if found {
                        format!("Collected {num} {block}.")
                    } else {
                        format!("No reachable {block} found to collect.")
                    }))
                })
            });
            Ok(run_action(&agent, false, 10, work).await)
        }),
    }
}

fn collect_all_blocks() -> CommandSpec {
    CommandSpec {
        name: "!collectAllBlocks",
        description: "Collect all the nearest blocks of a given type until told to stop.",
        params: vec![ParamSpec::new(
            "type",
            ArgType::BlockName,
            "The block type to collect.",
        )],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let block = args[0].str()?.to_string();
            let world = agent.world.clone();
            let coder = agent.coder.clone();
            // Collects one block per lap; the idle signal restarts the lap
            // until the supply runs out or the user stops it.
            let work: Work = Arc::new(move |sig| {
                let world = world.clone();
                let coder = coder.clone();
                let block = block.clone();
                Box::pin(async move {
                    let Some(found) = sig.race(world.collect_block(&block, 1)).await? else {
                        return Ok(None);
                    };
                    if !found {
                        coder.cancel_resume();
                        return Ok(Some(format!("No more {block} nearby to collect.")));
                    }
                    Ok(None)
                })
            });
            Ok(run_action(&agent, true, 3, work).await)
        }),
    }
}

fn craft_recipe() -> CommandSpec {
    CommandSpec {
        name: "!craftRecipe",
        description: "Craft the given recipe a given number of times.",
        params: vec![
            ParamSpec::new(
                "recipe_name",
                ArgType::ItemName,
                "The name of the output item to craft.",
            ),
            ParamSpec::new(
                "num",
                ArgType::Int,
                "The number of times to craft the recipe. This is NOT the number of output items, as it may craft many more items depending on the recipe.",
            )
            .domain(1.0, f64::INFINITY)
            .abs(),
        ],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let recipe = args[0].str()?.to_string();
            let num = args[1].count()?;
            let work = world_work(agent.world.clone(), move |world| {
                let recipe = recipe.clone();
                async move { world.craft_recipe(&recipe, num).await }
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn smelt_item() -> CommandSpec {
    CommandSpec {
        name: "!smeltItem",
        description: "Smelt the given item the given number of times.",
        params: vec![
            ParamSpec::new(
                "item_name",
                ArgType::ItemName,
                "The name of the input item to smelt.",
            ),
            ParamSpec::new("num", ArgType::Int, "The number of times to smelt the item.")
                .domain(1.0, f64::INFINITY)
                .abs(),
        ],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let item = args[0].str()?.to_string();
            let num = args[1].count()?;
            let work = world_work(agent.world.clone(), move |world| {
                let item = item.clone();
                async move { world.smelt_item(&item, num).await }
            });
            let response = run_action(&agent, false, -1, work).await;
            if let Some(message) = &response {
                if message.contains("Successfully") {
                    // The world connection leaves the inventory view stale
                    // after smelting; a supervised restart resynchronizes it.
                    agent
                        .clean_kill(
                            ShutdownReason::ForcedRestartRecovery,
                            &format!("{message} Safely restarting to update inventory."),
                        )
                        .await;
                }
            }
            Ok(response)
        }),
    }
}

fn clear_furnace() -> CommandSpec {
    CommandSpec {
        name: "!clearFurnace",
        description: "Take all items out of the nearest furnace.",
        params: vec![],
        format: None,
        action: true,
        handler: handler(|agent, _args| async move {
            let work = world_work(agent.world.clone(), |world| async move {
                world.clear_furnace().await
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn place_here() -> CommandSpec {
    CommandSpec {
        name: "!placeHere",
        description: "Place a given block in the current location. Do NOT use to build structures, only use for single blocks/torches.",
        params: vec![ParamSpec::new(
            "type",
            ArgType::BlockName,
            "The block type to place.",
        )],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let block = args[0].str()?.to_string();
            let world = agent.world.clone();
            let work: Work = Arc::new(move |sig| {
                let world = world.clone();
                let block = block.clone();
                Box::pin(async move {
                    let Some(pos) = sig.race(world.position()).await? else {
                        return Ok(None);
                    };
                    sig.race(world.place_block(&block, pos)).await
                })
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn attack() -> CommandSpec {
    CommandSpec {
        name: "!attack",
        description: "Attack and kill the nearest entity of a given type.",
        params: vec![ParamSpec::new(
            "type",
            ArgType::Str,
            "The type of entity to attack.",
        )],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let entity = args[0].str()?.to_string();
            let work = world_work(agent.world.clone(), move |world| {
                let entity = entity.clone();
                async move { world.attack_nearest(&entity).await }
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn go_to_bed() -> CommandSpec {
    CommandSpec {
        name: "!goToBed",
        description: "Go to the nearest bed and sleep.",
        params: vec![],
        format: None,
        action: true,
        handler: handler(|agent, _args| async move {
            let work = world_work(agent.world.clone(), |world| async move {
                world.go_to_bed().await
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn stay() -> CommandSpec {
    CommandSpec {
        name: "!stay",
        description: "Stay in the current location no matter what. Pauses all modes.",
        params: vec![],
        format: None,
        action: true,
        handler: handler(|agent, _args| async move {
            agent.modes.pause_all();
            let work = world_work(agent.world.clone(), |world| async move {
                world.stay().await
            });
            Ok(run_action(&agent, false, -1, work).await)
        }),
    }
}

fn set_mode() -> CommandSpec {
    CommandSpec {
        name: "!setMode",
        description: "Set a mode to on or off. A mode is an automatic behavior that constantly checks and responds to the environment.",
        params: vec![
            ParamSpec::new("mode_name", ArgType::Str, "The name of the mode to enable."),
            ParamSpec::new("on", ArgType::Bool, "Whether to enable or disable the mode."),
        ],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let name = args[0].str()?.to_string();
            let on = args[1].boolean()?;
            let state = if on { "on" } else { "off" };
            if !agent.modes.exists(&name) {
                return Ok(Some(format!(
                    "Mode {name} does not exist.\n{}",
                    agent.modes.docs()
                )));
            }
            if agent.modes.is_on(&name) == on {
                return Ok(Some(format!("Mode {name} is already {state}.")));
            }
            agent.modes.set_on(&name, on);
            Ok(Some(format!("Mode {name} is now {state}.")))
        }),
    }
}

fn goal() -> CommandSpec {
    CommandSpec {
        name: "!goal",
        description: "Set a goal prompt to endlessly work towards with continuous self-prompting.",
        params: vec![ParamSpec::new("selfPrompt", ArgType::Str, "The goal prompt.")],
        format: None,
        action: true,
        handler: handler(|agent, args| async move {
            let prompt = args[0].str()?.to_string();
            // Fire and forget: the loop reports through chat, not here.
            agent.self_prompter.start(&agent, &prompt);
            Ok(None)
        }),
    }
}

fn end_goal() -> CommandSpec {
    CommandSpec {
        name: "!endGoal",
        description: "Call when you have accomplished your goal. It will stop self-prompting and the current action.",
        params: vec![],
        format: None,
        action: true,
        handler: handler(|agent, _args| async move {
            agent.self_prompter.stop(&agent, true).await;
            Ok(Some("Self-prompting stopped.".to_string()))
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::super::execute_command;
    use super::*;
    use crate::agent::history::Turn;
    use crate::agent::Collaborators;
    use crate::config::Settings;
    use crate::llm::ChatModel;
    use crate::store::{MemorySnapshot, MemoryStore};
    use crate::world::{Position, StaticCatalog};

    #[derive(Default)]
    struct FakeWorld {
        chats: StdMutex<Vec<String>>,
        smelt_calls: StdMutex<Vec<(String, u32)>>,
    }

    #[async_trait]
    impl WorldApi for FakeWorld {
        async fn chat(&self, text: &str) -> anyhow::Result<()> {
            self.chats.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn position(&self) -> anyhow::Result<Position> {
            Ok(Position::default())
        }

        async fn smelt_item(&self, item: &str, count: u32) -> anyhow::Result<String> {
            self.smelt_calls
                .lock()
                .unwrap()
                .push((item.to_string(), count));
            Ok(format!("Successfully smelted {count} {item}."))
        }
    }

    struct NoModel;

    impl ChatModel for NoModel {
        fn prompt_conversation<'a>(
            &'a self,
            _history: Vec<Turn>,
        ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<String>> + Send + 'a>>
        {
            Box::pin(async { anyhow::bail!("model should not be consulted") })
        }
    }

    struct NullStore;

    impl MemoryStore for NullStore {
        fn save(&self, _snapshot: &MemorySnapshot) -> anyhow::Result<()> {
            Ok(())
        }

        fn load(&self) -> anyhow::Result<Option<MemorySnapshot>> {
            Ok(None)
        }
    }

    fn agent_with_world(world: Arc<FakeWorld>) -> Arc<Agent> {
        Agent::new(
            "ember",
            Settings::default(),
            Collaborators {
                world,
                model: Arc::new(NoModel),
                translator: Arc::new(crate::translate::Identity),
                store: Arc::new(NullStore),
                catalog: Arc::new(StaticCatalog::default()),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn smelt_success_requests_a_recovery_restart() {
        let world = Arc::new(FakeWorld::default());
        let agent = agent_with_world(world.clone());

        let out = execute_command(&agent, "!smeltItem(iron_ore, 2)").await;
        assert_eq!(
            out.as_deref(),
            Some("Successfully smelted 2 iron_ore.")
        );
        assert_eq!(
            world.smelt_calls.lock().unwrap().clone(),
            vec![("iron_ore".to_string(), 2)]
        );
        // clean_kill said goodbye and flagged the restart in history.
        assert!(world
            .chats
            .lock()
            .unwrap()
            .iter()
            .any(|c| c == "Goodbye world."));
        let turns = agent.history.lock().await.turns();
        assert!(turns
            .iter()
            .any(|t| t.content.contains("Safely restarting to update inventory.")));
    }

    #[tokio::test]
    async fn go_to_place_reports_unknown_names() {
        let world = Arc::new(FakeWorld::default());
        let agent = agent_with_world(world);

        let out = execute_command(&agent, "!goToPlace(\"base camp\")").await;
        assert_eq!(
            out.as_deref(),
            Some("No location named \"base camp\" saved.")
        );
    }

    #[tokio::test]
    async fn remember_here_then_saved_places_lists_it() {
        let world = Arc::new(FakeWorld::default());
        let agent = agent_with_world(world);

        let out = execute_command(&agent, "!rememberHere(home)").await;
        assert_eq!(out.as_deref(), Some("Location saved as \"home\"."));
        let places: BTreeMap<String, Position> = agent.places.lock().unwrap().clone();
        assert!(places.contains_key("home"));

        let out = execute_command(&agent, "!savedPlaces").await;
        assert_eq!(out.as_deref(), Some("SAVED PLACES: home"));
    }

    #[tokio::test]
    async fn new_action_refused_when_custom_actions_disabled() {
        let world = Arc::new(FakeWorld::default());
        let agent = agent_with_world(world);

        let out = execute_command(&agent, "!newAction(\"dig a moat\")").await;
        assert!(out.unwrap().contains("newAction not allowed!"));
    }

    #[tokio::test]
    async fn unsupported_skill_surfaces_as_textual_failure() {
        let world = Arc::new(FakeWorld::default());
        let agent = agent_with_world(world);

        // FakeWorld doesn't implement movement; the default body's error is
        // converted to an action-failure message, not a crash.
        let out = execute_command(&agent, "!moveAway(4)").await.unwrap();
        assert!(out.contains("Action failed"));
        assert!(out.contains("move_away"));
    }
}
