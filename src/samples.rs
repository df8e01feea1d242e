// src/samples.rs
//! Built-in sample agents and a small arena world
//!
//! The samples are exempt from the namespace policy and exist to exercise
//! the host: a demo battle in the binary, and fixtures for tests.
//!
//! - **SittingDuck**: never acts; keeps a round counter in its data directory
//! - **Spinner**: turns and fires at whatever it scans
//! - **Walls**: drives along the arena walls
//! - **Recorder**: event handler echoing each event it handles

use crate::agent::{Agent, AgentContext, EventHandler, Halt};
use crate::battle::snapshot::AgentView;
use crate::battle::world::{Advance, CommandsByAgent, World, WorldEvent};
use crate::events::event::{Event, EventKind};
use crate::loader::AgentPackage;
use crate::runtime::host::AgentControlPort;
use crate::runtime::identity::AgentId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tracing::debug;

const ARENA_WIDTH: f64 = 800.0;
const ARENA_HEIGHT: f64 = 600.0;
const AGENT_HALF_SIZE: f64 = 18.0;
const MAX_SPEED: f64 = 8.0;
const MAX_TURN_RATE: f64 = 10.0;
const FIRE_RANGE: f64 = 450.0;
const MIN_POWER: f64 = 0.1;
const MAX_POWER: f64 = 3.0;

/// Every sample, with its data directory under `data_root` when given
pub fn roster(data_root: Option<&Path>) -> Vec<AgentPackage> {
    let packages = vec![
        AgentPackage::builtin("sample.SittingDuck", || SittingDuck)
            .with_description("Sits still and counts how often it got to do so"),
        AgentPackage::builtin("sample.Spinner", Spinner::default)
            .with_description("Spins in place and fires at anything it scans"),
        AgentPackage::builtin("sample.Walls", Walls::default)
            .with_description("Moves around the outer edge of the arena"),
    ];
    match data_root {
        Some(root) => packages.into_iter().map(|p| p.with_data_root(root)).collect(),
        None => packages,
    }
}

pub struct SittingDuck;

impl Agent for SittingDuck {
    fn run(&mut self, ctx: &mut AgentContext) -> Result<(), Halt> {
        let rounds = ctx
            .read_data("count.dat")
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .and_then(|text| text.trim().parse::<u64>().ok())
            .unwrap_or(0)
            + 1;

        match ctx.open_data("count.dat", false) {
            Ok(mut file) => {
                if let Err(err) = write!(file, "{}", rounds) {
                    ctx.println(format!("I could not write the count file: {}", err));
                }
            }
            Err(err) => ctx.println(format!("I could not open the count file: {}", err)),
        }
        ctx.println(format!("I have been a sitting duck for {} rounds.", rounds));

        loop {
            ctx.execute()?;
        }
    }
}

#[derive(Default)]
pub struct Spinner {
    /// Fire power picked from the last scan
    target_power: Option<f64>,
}

impl Agent for Spinner {
    fn run(&mut self, ctx: &mut AgentContext) -> Result<(), Halt> {
        loop {
            ctx.act("turn", json!({ "degrees": MAX_TURN_RATE }));
            if let Some(power) = self.target_power.take() {
                ctx.act("fire", json!({ "power": power }));
            }
            ctx.execute()?;
            if let Some(event) = ctx.received_events().iter().rev().find(|e| *e.kind() == EventKind::Scanned) {
                let distance = event.data()["distance"].as_f64().unwrap_or(FIRE_RANGE);
                self.target_power = Some(if distance < 150.0 { MAX_POWER } else { 1.0 });
            }
        }
    }
}

#[derive(Default)]
pub struct Walls {
    /// Turns left of the current 90 degree turn
    turning: u32,
}

impl Agent for Walls {
    fn run(&mut self, ctx: &mut AgentContext) -> Result<(), Halt> {
        ctx.set_event_priority(EventKind::HitWall, 10);
        loop {
            if self.turning > 0 {
                ctx.act("turn", json!({ "degrees": MAX_TURN_RATE }));
                self.turning -= 1;
            } else {
                ctx.act("ahead", json!({ "distance": MAX_SPEED }));
            }
            ctx.execute()?;
            if self.turning == 0 && ctx.received_events().iter().any(|e| *e.kind() == EventKind::HitWall) {
                self.turning = (90.0 / MAX_TURN_RATE) as u32;
            }
        }
    }
}

/// Prints every event it handles; used to observe dispatch order
pub struct Recorder;

impl EventHandler for Recorder {
    fn on_event(&mut self, event: &Event, ctx: &mut AgentContext) -> Result<(), Halt> {
        ctx.println(format!("event {}", event.kind().name()));
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Body {
    name: String,
    x: f64,
    y: f64,
    heading: f64,
    alive: bool,
}

/// Minimal arena physics: movement, walls, scanning and bullets that hit
/// the nearest opponent in range on the turn they are fired
pub struct SampleWorld {
    seed: u64,
    bodies: BTreeMap<AgentId, Body>,
}

impl SampleWorld {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            bodies: BTreeMap::new(),
        }
    }

    fn nearest(&self, from: AgentId) -> Option<(AgentId, f64)> {
        let me = self.bodies.get(&from)?;
        self.bodies
            .iter()
            .filter(|(id, b)| **id != from && b.alive)
            .map(|(id, b)| (*id, (b.x - me.x).hypot(b.y - me.y)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    fn state(&self) -> serde_json::Value {
        let agents: Vec<serde_json::Value> = self
            .bodies
            .iter()
            .map(|(id, b)| {
                json!({
                    "id": id.0,
                    "name": b.name,
                    "x": b.x,
                    "y": b.y,
                    "heading": b.heading,
                    "alive": b.alive,
                })
            })
            .collect();
        json!({ "width": ARENA_WIDTH, "height": ARENA_HEIGHT, "agents": agents })
    }

    fn apply(&mut self, id: AgentId, name: &str, args: &serde_json::Value, control: &dyn AgentControlPort, advance: &mut Advance) {
        match name {
            "turn" => {
                if let Some(body) = self.bodies.get_mut(&id) {
                    let degrees = args["degrees"].as_f64().unwrap_or(0.0).clamp(-MAX_TURN_RATE, MAX_TURN_RATE);
                    body.heading = (body.heading + degrees).rem_euclid(360.0);
                }
            }
            "ahead" => {
                let Some(body) = self.bodies.get_mut(&id) else {
                    return;
                };
                let distance = args["distance"].as_f64().unwrap_or(0.0).clamp(-MAX_SPEED, MAX_SPEED);
                let radians = body.heading.to_radians();
                let x = body.x + distance * radians.sin();
                let y = body.y + distance * radians.cos();
                body.x = x.clamp(AGENT_HALF_SIZE, ARENA_WIDTH - AGENT_HALF_SIZE);
                body.y = y.clamp(AGENT_HALF_SIZE, ARENA_HEIGHT - AGENT_HALF_SIZE);
                if body.x != x || body.y != y {
                    advance.events.push(WorldEvent::new(id, EventKind::HitWall, json!({ "x": body.x, "y": body.y })));
                }
            }
            "fire" => self.fire(id, args, control, advance),
            other => debug!(agent = %id, action = other, "ignoring unknown action"),
        }
    }

    fn fire(&mut self, id: AgentId, args: &serde_json::Value, control: &dyn AgentControlPort, advance: &mut Advance) {
        let energy = control.energy(id).unwrap_or(0.0);
        let power = args["power"].as_f64().unwrap_or(1.0).clamp(MIN_POWER, MAX_POWER);
        if energy <= power {
            return;
        }
        control.set_energy(id, energy - power);

        match self.nearest(id) {
            Some((target, distance)) if distance <= FIRE_RANGE => {
                let damage = 4.0 * power + (2.0 * (power - 1.0)).max(0.0);
                let left = (control.energy(target).unwrap_or(0.0) - damage).max(0.0);
                control.set_energy(target, left);
                control.set_energy(id, control.energy(id).unwrap_or(0.0) + 3.0 * power);
                advance.events.push(WorldEvent::new(id, EventKind::BulletHit, json!({ "victim": target.0, "energy": left })));
                advance.events.push(WorldEvent::new(target, EventKind::HitByBullet, json!({ "power": power })));
            }
            _ => advance.events.push(WorldEvent::new(id, EventKind::BulletMissed, json!({ "power": power }))),
        }
    }
}

impl World for SampleWorld {
    fn start_round(&mut self, round: u32, agents: &[AgentView], _control: &dyn AgentControlPort) -> serde_json::Value {
        let mut rng = StdRng::seed_from_u64(self.seed ^ u64::from(round));
        self.bodies = agents
            .iter()
            .map(|view| {
                let body = Body {
                    name: view.name.clone(),
                    x: rng.gen_range(AGENT_HALF_SIZE..ARENA_WIDTH - AGENT_HALF_SIZE),
                    y: rng.gen_range(AGENT_HALF_SIZE..ARENA_HEIGHT - AGENT_HALF_SIZE),
                    heading: rng.gen_range(0.0..360.0),
                    alive: view.alive,
                };
                (view.id, body)
            })
            .collect();
        self.state()
    }

    fn advance(&mut self, turn: u64, commands: &CommandsByAgent, control: &dyn AgentControlPort) -> Advance {
        let mut advance = Advance::new(serde_json::Value::Null);

        for (id, buffer) in commands {
            if !control.is_alive(*id) {
                continue;
            }
            for action in buffer.actions() {
                self.apply(*id, &action.name, &action.args, control, &mut advance);
            }
        }

        let ids: Vec<AgentId> = self.bodies.keys().copied().collect();
        for id in &ids {
            let alive = control.is_alive(*id);
            if let Some(body) = self.bodies.get_mut(id) {
                if body.alive && !alive {
                    body.alive = false;
                    advance.events.push(WorldEvent::new(*id, EventKind::Death, json!({ "turn": turn })));
                }
            }
        }

        for id in &ids {
            let Some(body) = self.bodies.get(id).filter(|b| b.alive) else {
                continue;
            };
            advance.events.push(WorldEvent::new(
                *id,
                EventKind::Status,
                json!({
                    "energy": control.energy(*id).unwrap_or(0.0),
                    "x": body.x,
                    "y": body.y,
                    "heading": body.heading,
                }),
            ));
            if let Some((other, distance)) = self.nearest(*id) {
                let name = self.bodies.get(&other).map(|b| b.name.clone()).unwrap_or_default();
                advance.events.push(WorldEvent::new(
                    *id,
                    EventKind::Scanned,
                    json!({
                        "name": name,
                        "distance": distance,
                    }),
                ));
            }
        }

        let survivors: Vec<AgentId> = self.bodies.iter().filter(|(_, b)| b.alive).map(|(id, _)| *id).collect();
        advance.world = self.state();
        if self.bodies.len() > 1 && survivors.len() <= 1 {
            if let Some(winner) = survivors.first() {
                advance.events.push(WorldEvent::new(*winner, EventKind::Win, json!({ "turn": turn })));
            }
            advance = advance.finished();
        }
        advance
    }

    fn snapshot(&self) -> serde_json::Value {
        self.state()
    }
}
