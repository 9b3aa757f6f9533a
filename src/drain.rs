use crate::error_handling::ConfigError;
use serde::Serialize;
use std::collections::HashMap;

pub const WILDCARD_TOKEN: &str = "<*>";

#[derive(Debug, Clone, PartialEq)]
pub struct MinerConfig {
    /// Tree depth including the token-count level; leading tokens used for routing = depth - 1
    pub depth: usize,
    /// Maximum children per internal node, the wildcard branch included
    pub max_children: usize,
    /// Minimum fraction of matching positions for a signature to join a cluster
    pub similarity: f64,
    /// Maximum clusters per leaf before the least-recently-matched one is evicted
    pub max_clusters: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            depth: 4,
            max_children: 100,
            similarity: 0.4,
            max_clusters: 1000,
        }
    }
}

impl MinerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity) {
            return Err(ConfigError::OutOfUnitRange {
                name: "similarity",
                value: self.similarity,
            });
        }
        if self.depth < 2 {
            return Err(ConfigError::TooSmall {
                name: "depth",
                min: 2,
                value: self.depth,
            });
        }
        if self.max_children < 1 {
            return Err(ConfigError::TooSmall {
                name: "max_children",
                min: 1,
                value: self.max_children,
            });
        }
        if self.max_clusters < 1 {
            return Err(ConfigError::TooSmall {
                name: "max_clusters",
                min: 1,
                value: self.max_clusters,
            });
        }
        Ok(())
    }
}

/// What an `add` did to the cluster table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ChangeType {
    ClusterCreated,
    /// A new cluster took the slot of the least-recently-matched one
    ClusterEvicted { evicted_id: u64 },
    TemplateChanged,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MinedTemplate {
    pub cluster_id: u64,
    pub template: String,
    pub size: usize,
    pub change: ChangeType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateSummary {
    pub cluster_id: u64,
    pub template: String,
    pub size: usize,
}

#[derive(Debug)]
struct Cluster {
    template_tokens: Vec<String>,
    size: usize,
    last_matched: u64,
}

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    /// Creation order, so ties resolve to the oldest cluster
    cluster_ids: Vec<u64>,
}

/// Online Drain-style template miner with a bounded cluster table.
///
/// Signatures are routed by token count and then by their leading tokens;
/// each leaf holds at most `max_clusters` clusters. Identical input sequences
/// always yield identical id assignments.
#[derive(Debug)]
pub struct TemplateMiner {
    config: MinerConfig,
    roots: HashMap<usize, Node>,
    clusters: HashMap<u64, Cluster>,
    next_id: u64,
    tick: u64,
}

impl TemplateMiner {
    pub fn new(config: MinerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            roots: HashMap::new(),
            clusters: HashMap::new(),
            next_id: 1,
            tick: 0,
        })
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    /// Assign a signature to a cluster. Never fails.
    pub fn add(&mut self, text: &str) -> MinedTemplate {
        let tokens: Vec<String> = text.split_whitespace().map(str::to_string).collect();
        let token_count = tokens.len();
        let depth = self.config.depth.min(token_count.max(1));
        self.tick += 1;
        let tick = self.tick;

        let root = self.roots.entry(token_count).or_default();
        let leaf = descend_to_leaf(root, &tokens, depth, self.config.max_children);

        let best = best_match(leaf, &tokens, &self.clusters, self.config.similarity);

        let (cluster_id, change) = match best {
            Some(cluster_id) => {
                let change = match self.clusters.get_mut(&cluster_id) {
                    Some(cluster) => {
                        let changed = generalize(&mut cluster.template_tokens, &tokens);
                        cluster.size += 1;
                        cluster.last_matched = tick;
                        if changed {
                            ChangeType::TemplateChanged
                        } else {
                            ChangeType::None
                        }
                    }
                    None => ChangeType::None,
                };
                (cluster_id, change)
            }
            None => {
                let evicted = if leaf.cluster_ids.len() >= self.config.max_clusters {
                    evict_least_recent(leaf, &mut self.clusters)
                } else {
                    None
                };

                let cluster_id = self.next_id;
                self.next_id += 1;
                self.clusters.insert(
                    cluster_id,
                    Cluster {
                        template_tokens: tokens,
                        size: 1,
                        last_matched: tick,
                    },
                );
                leaf.cluster_ids.push(cluster_id);

                let change = match evicted {
                    Some(evicted_id) => ChangeType::ClusterEvicted { evicted_id },
                    None => ChangeType::ClusterCreated,
                };
                (cluster_id, change)
            }
        };

        let (template, size) = self
            .clusters
            .get(&cluster_id)
            .map(|c| (c.template_tokens.join(" "), c.size))
            .unwrap_or_default();

        MinedTemplate {
            cluster_id,
            template,
            size,
            change,
        }
    }

    pub fn get(&self, cluster_id: u64) -> Option<TemplateSummary> {
        self.clusters.get(&cluster_id).map(|cluster| TemplateSummary {
            cluster_id,
            template: cluster.template_tokens.join(" "),
            size: cluster.size,
        })
    }

    /// Live clusters (evicted ones are gone)
    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// All live templates, most populated first
    pub fn templates(&self) -> Vec<TemplateSummary> {
        let mut templates: Vec<TemplateSummary> = self
            .clusters
            .iter()
            .map(|(&cluster_id, cluster)| TemplateSummary {
                cluster_id,
                template: cluster.template_tokens.join(" "),
                size: cluster.size,
            })
            .collect();

        templates.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then_with(|| a.template.cmp(&b.template))
                .then_with(|| a.cluster_id.cmp(&b.cluster_id))
        });

        templates
    }
}

fn descend_to_leaf<'a>(
    root: &'a mut Node,
    tokens: &[String],
    depth: usize,
    max_children: usize,
) -> &'a mut Node {
    let mut node = root;
    for token in tokens.iter().take(depth.saturating_sub(1)) {
        let mut key = if is_variable_token(token) {
            WILDCARD_TOKEN
        } else {
            token.as_str()
        };

        // Last free slot is kept for the wildcard branch
        if !node.children.contains_key(key)
            && key != WILDCARD_TOKEN
            && node.children.len() + 1 >= max_children
        {
            key = WILDCARD_TOKEN;
        }

        node = node.children.entry(key.to_string()).or_default();
    }

    node
}

fn best_match(
    leaf: &Node,
    tokens: &[String],
    clusters: &HashMap<u64, Cluster>,
    threshold: f64,
) -> Option<u64> {
    let mut best: Option<(u64, f64)> = None;

    for &cluster_id in &leaf.cluster_ids {
        let Some(cluster) = clusters.get(&cluster_id) else {
            continue;
        };
        let similarity = template_similarity(&cluster.template_tokens, tokens);
        if similarity < threshold {
            continue;
        }
        // Strictly greater: the earliest-created cluster wins ties
        if best.map_or(true, |(_, score)| similarity > score) {
            best = Some((cluster_id, similarity));
        }
    }

    best.map(|(cluster_id, _)| cluster_id)
}

fn evict_least_recent(leaf: &mut Node, clusters: &mut HashMap<u64, Cluster>) -> Option<u64> {
    let (position, evicted_id) = leaf
        .cluster_ids
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| {
            let last = clusters.get(id).map_or(0, |c| c.last_matched);
            (last, **id)
        })
        .map(|(position, id)| (position, *id))?;

    leaf.cluster_ids.remove(position);
    clusters.remove(&evicted_id);
    Some(evicted_id)
}

/// Turn every differing position into a wildcard; true if anything changed
fn generalize(template: &mut [String], tokens: &[String]) -> bool {
    let mut changed = false;
    for (existing, token) in template.iter_mut().zip(tokens) {
        if existing != WILDCARD_TOKEN && existing != token {
            *existing = WILDCARD_TOKEN.to_string();
            changed = true;
        }
    }
    changed
}

fn is_variable_token(token: &str) -> bool {
    token.chars().any(|ch| ch.is_ascii_digit()) || (token.contains('<') && token.contains('>'))
}

/// Fraction of positions that match; wildcard positions always match
fn template_similarity(template: &[String], tokens: &[String]) -> f64 {
    if template.is_empty() && tokens.is_empty() {
        return 1.0;
    }

    let matches = template
        .iter()
        .zip(tokens)
        .filter(|(templ, token)| *templ == WILDCARD_TOKEN || templ == token)
        .count();

    matches as f64 / template.len().max(tokens.len()).max(1) as f64
}

pub fn format_templates_output(templates: &[TemplateSummary]) -> String {
    if templates.is_empty() {
        return "No templates found".to_string();
    }

    let mut output = String::new();
    output.push_str(&format!("templates ({} items):\n", templates.len()));

    for template in templates {
        output.push_str(&format!(
            "  #{:<5} {:<60} {}\n",
            template.cluster_id, template.template, template.size
        ));
    }

    output.trim_end().to_string()
}
