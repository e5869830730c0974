use std::sync::Arc;

use agora_store::{EntitySummary, StoreResult};
use agora_sync::LoopbackHub;
use agora_types::{EntityId, EntityKind, Zone};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::node::Node;

/// Parameters of an in-process replication run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub nodes: usize,
    /// Random authoring operations spread across the nodes.
    pub ops: usize,
    /// Probability that a single publish delivery is dropped.
    pub loss: f64,
    pub seed: u64,
    /// Anti-entropy rounds (every node once) before giving up.
    pub max_rounds: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            ops: 50,
            loss: 0.3,
            seed: 7,
            max_rounds: 5,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub nodes: usize,
    pub posts_created: usize,
    pub posts_updated: usize,
    pub posts_deleted: usize,
    pub comments_created: usize,
    /// Anti-entropy rounds run until convergence (or the limit).
    pub rounds: usize,
    pub converged: bool,
    /// Entity count per node, tombstones included.
    pub entities: Vec<usize>,
}

/// Author random traffic on `nodes` replicas over a lossy loopback network,
/// then run anti-entropy rounds until every replica holds the same state.
pub async fn simulate(config: &SimulationConfig) -> NodeResult<SimulationReport> {
    if config.nodes == 0 {
        return Err(NodeError::InvalidInput("simulation needs at least one node".into()));
    }
    if !(0.0..=1.0).contains(&config.loss) {
        return Err(NodeError::InvalidInput(format!(
            "loss rate {} is outside 0..=1",
            config.loss
        )));
    }

    let hub = LoopbackHub::with_loss(config.loss, config.seed);
    let mut nodes = Vec::with_capacity(config.nodes);
    for i in 0..config.nodes {
        let node_config = NodeConfig {
            node_id: format!("node-{i}"),
            ..NodeConfig::default()
        };
        nodes.push(Node::join(node_config, &hub)?);
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut report = SimulationReport {
        nodes: config.nodes,
        ..SimulationReport::default()
    };
    for step in 0..config.ops {
        let node = &nodes[rng.gen_range(0..nodes.len())];
        let posts = live_posts(node)?;
        let roll = rng.gen_range(0..10);
        match posts.choose(&mut rng) {
            Some(target) if roll < 2 => {
                node.create_comment(target, None, &format!("comment {step}")).await?;
                report.comments_created += 1;
            }
            Some(target) if roll < 4 => {
                let body = format!("revised body {step}");
                node.update_post(target, Some(&format!("revised {step}")), Some(body.as_bytes()))
                    .await?;
                report.posts_updated += 1;
            }
            Some(target) if roll < 5 => {
                node.delete_post(target).await?;
                report.posts_deleted += 1;
            }
            _ => {
                let body = format!("body {step} from {}", node.id());
                node.create_post(&format!("post {step}"), body.as_bytes(), Zone::Public)
                    .await?;
                report.posts_created += 1;
            }
        }
    }

    report.converged = converged(&nodes)?;
    while !report.converged && report.rounds < config.max_rounds {
        report.rounds += 1;
        for node in &nodes {
            node.sync_now().await?;
        }
        report.converged = converged(&nodes)?;
        debug!(round = report.rounds, converged = report.converged, "simulation round");
    }
    for node in &nodes {
        report.entities.push(node.store().len()?);
    }

    info!(
        nodes = report.nodes,
        ops = config.ops,
        loss = config.loss,
        rounds = report.rounds,
        converged = report.converged,
        "simulation finished"
    );
    Ok(report)
}

fn live_posts(node: &Node) -> StoreResult<Vec<EntityId>> {
    Ok(node
        .store()
        .entities_since(0, usize::MAX)?
        .into_iter()
        .filter(|e| e.kind == EntityKind::Post && !e.deleted)
        .map(|e| e.id)
        .collect())
}

fn converged(nodes: &[Arc<Node>]) -> StoreResult<bool> {
    let Some((first, rest)) = nodes.split_first() else {
        return Ok(true);
    };
    let expected: Vec<EntitySummary> = first.store().summaries()?;
    for node in rest {
        if node.store().summaries()? != expected {
            return Ok(false);
        }
    }
    Ok(true)
}
