//! The self-prompt loop: an active goal is an indefinitely repeating
//! self-conversation. Each cycle feeds the stored goal prompt back through
//! the message-handling loop as a system-sourced turn, until an external
//! interruption (user command, explicit stop, silence) pre-empts it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use super::history::Speaker;
use super::Agent;

/// Restart delay after the loop yields to external input.
const COOLDOWN: Duration = Duration::from_millis(2000);
/// Consecutive commandless responses before the goal is abandoned.
const MAX_NO_COMMAND: u32 = 3;

pub struct SelfPrompter {
    on: AtomicBool,
    loop_active: AtomicBool,
    interrupt: AtomicBool,
    prompt: StdMutex<Option<String>>,
    idle_ms: AtomicU64,
}

impl Default for SelfPrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl SelfPrompter {
    pub fn new() -> Self {
        Self {
            on: AtomicBool::new(false),
            loop_active: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            prompt: StdMutex::new(None),
            idle_ms: AtomicU64::new(0),
        }
    }

    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    /// The prompt to persist, present only while a goal is active.
    pub fn active_prompt(&self) -> Option<String> {
        if self.is_on() {
            self.prompt.lock().unwrap().clone()
        } else {
            None
        }
    }

    /// Activates the goal and starts cycling. Starting a new goal replaces
    /// any previous one; no explicit stop is required first.
    pub fn start(&self, agent: &Arc<Agent>, prompt: &str) {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            tracing::warn!("ignoring empty goal prompt");
            return;
        }
        *self.prompt.lock().unwrap() = Some(prompt.to_string());
        self.interrupt.store(false, Ordering::SeqCst);
        self.on.store(true, Ordering::SeqCst);
        self.spawn_loop(agent);
    }

    fn spawn_loop(&self, agent: &Arc<Agent>) {
        if self
            .loop_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let agent = agent.clone();
        tokio::spawn(async move {
            let this = &agent.self_prompter;
            let mut no_command_streak = 0u32;
            let mut aborted = false;

            while !this.interrupt.load(Ordering::SeqCst) && this.on.load(Ordering::SeqCst) {
                let Some(prompt) = this.prompt.lock().unwrap().clone() else {
                    break;
                };
                let message = format!(
                    "You are self-prompting with the goal: '{prompt}'. Your next response MUST contain a command. Respond:"
                );
                match agent
                    .handle_message(Speaker::System, &message, Some(-1))
                    .await
                {
                    Ok(true) => no_command_streak = 0,
                    Ok(false) => {
                        no_command_streak += 1;
                        if no_command_streak >= MAX_NO_COMMAND {
                            aborted = true;
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::error!("self-prompt cycle failed: {err:#}");
                        aborted = true;
                        break;
                    }
                }
            }

            this.loop_active.store(false, Ordering::SeqCst);
            if aborted {
                this.on.store(false, Ordering::SeqCst);
                let _ = agent
                    .clean_chat(&format!(
                        "Aborting self-prompting after {MAX_NO_COMMAND} responses in a row with no commands."
                    ))
                    .await;
            }
        });
    }

    /// Driven from the supervisor tick: once the goal has been idle past the
    /// cooldown and the engine is free, the loop restarts.
    pub fn update(&self, agent: &Arc<Agent>, delta: Duration) {
        if self.is_on()
            && !self.loop_active.load(Ordering::SeqCst)
            && !self.interrupt.load(Ordering::SeqCst)
        {
            let idle = self
                .idle_ms
                .fetch_add(delta.as_millis() as u64, Ordering::SeqCst)
                + delta.as_millis() as u64;
            if idle >= COOLDOWN.as_millis() as u64 && agent.is_idle() {
                self.idle_ms.store(0, Ordering::SeqCst);
                self.spawn_loop(agent);
            }
        } else {
            self.idle_ms.store(0, Ordering::SeqCst);
        }
    }

    /// True when a pending external interruption should pre-empt the current
    /// self-prompted turn.
    pub fn should_interrupt(&self, is_self_prompt: bool) -> bool {
        is_self_prompt && self.is_on() && self.interrupt.load(Ordering::SeqCst)
    }

    /// Bookkeeping hook: a user-triggered action pre-empts the cycle (the
    /// goal stays active and resumes once the agent is idle again). Query
    /// commands don't count as progress and don't interrupt. Fire-and-forget:
    /// the caller is about to supersede the engine task the loop may be
    /// blocked on, so waiting here would deadlock.
    pub fn handle_user_prompted_cmd(self: &Arc<Self>, is_self_prompt: bool, is_action: bool) {
        if self.is_on() && !is_self_prompt && is_action {
            let this = self.clone();
            tokio::spawn(async move { this.stop_loop().await });
        }
    }

    /// Deactivates the goal. `stop_action` also cancels whatever the engine
    /// is running; silence (`!stfu`) keeps the current action going.
    pub async fn stop(&self, agent: &Arc<Agent>, stop_action: bool) {
        self.interrupt.store(true, Ordering::SeqCst);
        if stop_action {
            agent.coder.stop().await;
        }
        self.wait_loop_end().await;
        self.interrupt.store(false, Ordering::SeqCst);
        self.on.store(false, Ordering::SeqCst);
    }

    async fn stop_loop(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.wait_loop_end().await;
        self.interrupt.store(false, Ordering::SeqCst);
    }

    async fn wait_loop_end(&self) {
        while self.loop_active.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_interrupt_requires_active_goal_and_pending_interrupt() {
        let sp = SelfPrompter::new();
        assert!(!sp.should_interrupt(true));

        sp.on.store(true, Ordering::SeqCst);
        assert!(!sp.should_interrupt(true));

        sp.interrupt.store(true, Ordering::SeqCst);
        assert!(sp.should_interrupt(true));
        // Non-self-prompt turns are never pre-empted by the goal loop.
        assert!(!sp.should_interrupt(false));
    }

    #[test]
    fn active_prompt_only_while_on() {
        let sp = SelfPrompter::new();
        *sp.prompt.lock().unwrap() = Some("dig down".to_string());
        assert_eq!(sp.active_prompt(), None);
        sp.on.store(true, Ordering::SeqCst);
        assert_eq!(sp.active_prompt(), Some("dig down".to_string()));
    }
}
