//! Background mode supervisor: always-on behavior checks evaluated on a
//! fixed, drift-corrected tick. A check may pause the execution engine's
//! current task (cooperative pause, not cancellation) while it acts, and
//! reports what it did as a terse behavior-log line.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use super::Agent;

pub type ModeCheckFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send>>;
pub type ModeCheck = Arc<dyn Fn(Arc<Agent>) -> ModeCheckFuture + Send + Sync>;

/// Supervisor pass period.
pub const TICK_PERIOD: Duration = Duration::from_millis(300);

const HUNGER_THRESHOLD: f64 = 14.0;
const DAMAGE_WINDOW: Duration = Duration::from_secs(3);

struct Mode {
    name: &'static str,
    description: &'static str,
    on: bool,
    paused: bool,
    check: ModeCheck,
}

/// Name -> mode mapping with deterministic iteration order for the behavior
/// log. Enablement is process-lifetime only; it resets on restart.
pub struct ModeSupervisor {
    modes: StdMutex<Vec<Mode>>,
    behavior_log: StdMutex<String>,
}

impl Default for ModeSupervisor {
    fn default() -> Self {
        Self::with_modes(default_modes())
    }
}

impl ModeSupervisor {
    fn with_modes(modes: Vec<Mode>) -> Self {
        Self {
            modes: StdMutex::new(modes),
            behavior_log: StdMutex::new(String::new()),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.modes.lock().unwrap().iter().any(|m| m.name == name)
    }

    pub fn is_on(&self, name: &str) -> bool {
        self.modes
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.on)
            .unwrap_or(false)
    }

    pub fn set_on(&self, name: &str, on: bool) {
        if let Some(mode) = self
            .modes
            .lock()
            .unwrap()
            .iter_mut()
            .find(|m| m.name == name)
        {
            mode.on = on;
        }
    }

    pub fn pause_all(&self) {
        for mode in self.modes.lock().unwrap().iter_mut() {
            mode.paused = true;
        }
    }

    pub fn unpause_all(&self) {
        for mode in self.modes.lock().unwrap().iter_mut() {
            mode.paused = false;
        }
    }

    pub fn docs(&self) -> String {
        let modes = self.modes.lock().unwrap();
        let mut out = String::from("Available Modes:");
        for mode in modes.iter() {
            let state = if mode.on { "on" } else { "off" };
            out.push_str(&format!("\n- {}({state}): {}", mode.name, mode.description));
        }
        out
    }

    /// Drains the accumulated behavior log.
    pub fn flush_behavior_log(&self) -> String {
        std::mem::take(&mut *self.behavior_log.lock().unwrap())
    }

    /// One supervisor pass: every enabled, unpaused mode gets its check run.
    pub async fn update(&self, agent: &Arc<Agent>) {
        let checks: Vec<(&'static str, ModeCheck)> = self
            .modes
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.on && !m.paused)
            .map(|m| (m.name, m.check.clone()))
            .collect();

        for (name, check) in checks {
            match check(agent.clone()).await {
                Ok(Some(line)) => self.log_behavior(agent, &line).await,
                Ok(None) => {}
                Err(err) => tracing::warn!(mode = name, "mode check failed: {err:#}"),
            }
        }
    }

    async fn log_behavior(&self, agent: &Arc<Agent>, line: &str) {
        // Lines are newline-led so the history note can trim to whole lines.
        self.behavior_log
            .lock()
            .unwrap()
            .push_str(&format!("\n{line}"));
        if agent.settings.narrate_behavior {
            let _ = agent.clean_chat(line).await;
        }
    }
}

/// Remaining sleep budget for a drift-corrected tick: one pass runs per
/// cycle regardless of how long the previous pass took, and only the
/// leftover budget is slept. Zero or negative leftover means run again
/// immediately.
pub(crate) fn remaining_budget(period: Duration, elapsed: Duration) -> Option<Duration> {
    period.checked_sub(elapsed).filter(|d| !d.is_zero())
}

fn default_modes() -> Vec<Mode> {
    vec![
        Mode {
            name: "self_preservation",
            description: "Automatically eat when your hunger gets low.",
            on: true,
            paused: false,
            check: Arc::new(|agent| {
                Box::pin(async move {
                    if agent.current_food() >= HUNGER_THRESHOLD {
                        return Ok(None);
                    }
                    agent.coder.pause();
                    let note = agent.world.auto_eat().await;
                    agent.coder.unpause();
                    note
                })
            }),
        },
        Mode {
            name: "self_defense",
            description: "Automatically fight back when attacked.",
            on: true,
            paused: false,
            check: Arc::new(|agent| {
                Box::pin(async move {
                    if !agent.recently_damaged(DAMAGE_WINDOW) {
                        return Ok(None);
                    }
                    agent.coder.pause();
                    let note = agent.world.defend_self().await;
                    agent.coder.unpause();
                    note
                })
            }),
        },
        Mode {
            name: "item_collecting",
            description: "Pick up nearby dropped items when idle.",
            on: true,
            paused: false,
            check: Arc::new(|agent| {
                Box::pin(async move {
                    if !agent.is_idle() {
                        return Ok(None);
                    }
                    let picked = agent.world.pick_up_nearby_items().await?;
                    if picked == 0 {
                        return Ok(None);
                    }
                    Ok(Some(format!("Picked up {picked} item(s).")))
                })
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggling_and_lookup() {
        let modes = ModeSupervisor::default();
        assert!(modes.exists("self_defense"));
        assert!(!modes.exists("teleporting"));
        assert!(modes.is_on("self_defense"));
        modes.set_on("self_defense", false);
        assert!(!modes.is_on("self_defense"));
        // Unknown names read as off.
        assert!(!modes.is_on("teleporting"));
    }

    #[test]
    fn docs_list_every_mode_with_state() {
        let modes = ModeSupervisor::default();
        modes.set_on("item_collecting", false);
        let docs = modes.docs();
        assert!(docs.contains("self_preservation(on)"));
        assert!(docs.contains("item_collecting(off)"));
    }

    #[test]
    fn flush_drains_the_log() {
        let modes = ModeSupervisor::default();
        modes
            .behavior_log
            .lock()
            .unwrap()
            .push_str("\nPicked up 2 item(s).");
        let log = modes.flush_behavior_log();
        assert!(log.contains("Picked up"));
        assert!(modes.flush_behavior_log().is_empty());
    }

    #[test]
    fn remaining_budget_is_drift_corrected() {
        let period = Duration::from_millis(300);
        assert_eq!(
            remaining_budget(period, Duration::from_millis(100)),
            Some(Duration::from_millis(200))
        );
        // A pass that overran its budget reruns immediately.
        assert_eq!(remaining_budget(period, Duration::from_millis(300)), None);
        assert_eq!(remaining_budget(period, Duration::from_millis(900)), None);
    }
}
