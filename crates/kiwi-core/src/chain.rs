// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolved executor chains and their structural invariants.
//!
//! A chain is ordered leaf→primitive: `chain[i].executor_id` names
//! `chain[i + 1].tool_id`, the last link is a primitive with no executor,
//! and no tool appears twice.

use serde::{Deserialize, Serialize};
use std::fmt;

use kiwi_error::ErrorCode;

use crate::{ToolId, ToolVersion};

/// A structural defect found by [`ResolvedChain::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainIssue {
    /// The chain has no links at all.
    Empty,
    /// A link's `executor_id` does not name the next link.
    BrokenLink {
        /// Position of the offending link.
        index: usize,
        /// The executor the link declares, if any.
        declared: Option<ToolId>,
        /// The tool that actually follows.
        next: ToolId,
    },
    /// The terminal link is not a primitive.
    TerminalNotPrimitive {
        /// Tool id of the terminal link.
        tool_id: ToolId,
    },
    /// The terminal primitive still declares an executor.
    PrimitiveHasExecutor {
        /// Tool id of the primitive.
        tool_id: ToolId,
    },
    /// A tool id appears more than once in the chain.
    DuplicateTool {
        /// The repeated tool id.
        tool_id: ToolId,
    },
}

impl ChainIssue {
    /// Map the issue to its stable [`ErrorCode`].
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Empty | Self::BrokenLink { .. } => ErrorCode::Internal,
            Self::TerminalNotPrimitive { .. } => ErrorCode::ChainNotPrimitive,
            Self::PrimitiveHasExecutor { .. } => ErrorCode::MissingExecutor,
            Self::DuplicateTool { .. } => ErrorCode::CycleDetected,
        }
    }
}

impl fmt::Display for ChainIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "chain is empty"),
            Self::BrokenLink {
                index,
                declared,
                next,
            } => match declared {
                Some(d) => write!(f, "link {index} declares executor {d} but {next} follows"),
                None => write!(f, "link {index} declares no executor but {next} follows"),
            },
            Self::TerminalNotPrimitive { tool_id } => {
                write!(f, "terminal link {tool_id} is not a primitive")
            }
            Self::PrimitiveHasExecutor { tool_id } => {
                write!(f, "primitive {tool_id} declares an executor")
            }
            Self::DuplicateTool { tool_id } => write!(f, "tool {tool_id} appears twice"),
        }
    }
}

impl std::error::Error for ChainIssue {}

/// An ordered executor chain from a requested leaf down to its primitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedChain {
    links: Vec<ToolVersion>,
}

impl ResolvedChain {
    /// Wrap an ordered list of links (leaf first).
    #[must_use]
    pub fn new(links: Vec<ToolVersion>) -> Self {
        Self { links }
    }

    /// All links, leaf first.
    #[must_use]
    pub fn links(&self) -> &[ToolVersion] {
        &self.links
    }

    /// The requested leaf tool.
    #[must_use]
    pub fn leaf(&self) -> Option<&ToolVersion> {
        self.links.first()
    }

    /// The terminal primitive.
    #[must_use]
    pub fn primitive(&self) -> Option<&ToolVersion> {
        self.links.last()
    }

    /// Number of links.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Returns `true` when the chain has no links.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Iterate over the links, leaf first.
    pub fn iter(&self) -> std::slice::Iter<'_, ToolVersion> {
        self.links.iter()
    }

    /// Iterate over adjacent `(child, parent)` pairs, leaf first.
    pub fn pairs(&self) -> impl Iterator<Item = (&ToolVersion, &ToolVersion)> {
        self.links.iter().zip(self.links.iter().skip(1))
    }

    /// Whether any link carries the given tool id.
    #[must_use]
    pub fn contains(&self, tool_id: &ToolId) -> bool {
        self.links.iter().any(|tv| &tv.tool_id == tool_id)
    }

    /// Verify the structural invariants, returning the first defect found.
    ///
    /// # Errors
    ///
    /// Returns a [`ChainIssue`] describing the defect.
    pub fn check(&self) -> Result<(), ChainIssue> {
        if self.links.is_empty() {
            return Err(ChainIssue::Empty);
        }

        let mut seen = std::collections::BTreeSet::new();
        for link in &self.links {
            if !seen.insert(link.tool_id.clone()) {
                return Err(ChainIssue::DuplicateTool {
                    tool_id: link.tool_id.clone(),
                });
            }
        }

        for (i, pair) in self.links.windows(2).enumerate() {
            let declared = pair[0].executor_id.clone();
            if declared.as_ref() != Some(&pair[1].tool_id) {
                return Err(ChainIssue::BrokenLink {
                    index: i,
                    declared,
                    next: pair[1].tool_id.clone(),
                });
            }
        }

        let terminal = &self.links[self.links.len() - 1];
        if !terminal.tool_type.is_primitive() {
            return Err(ChainIssue::TerminalNotPrimitive {
                tool_id: terminal.tool_id.clone(),
            });
        }
        if terminal.executor_id.is_some() {
            return Err(ChainIssue::PrimitiveHasExecutor {
                tool_id: terminal.tool_id.clone(),
            });
        }

        Ok(())
    }

    /// One-line human summary: `a -> b -> c`.
    #[must_use]
    pub fn describe(&self) -> String {
        self.links
            .iter()
            .map(|tv| format!("{}@{}", tv.tool_id, tv.version))
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

impl<'a> IntoIterator for &'a ResolvedChain {
    type Item = &'a ToolVersion;
    type IntoIter = std::slice::Iter<'a, ToolVersion>;

    fn into_iter(self) -> Self::IntoIter {
        self.links.iter()
    }
}
