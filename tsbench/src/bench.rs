//! The query path: running decoded queries against a target.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use futures::StreamExt;

use crate::error::Result;
use crate::executor::{Handler, Phases};
use crate::query::Query;
use crate::target::{Aggregation, BoxedQuerier, Selection, StepAggregator};

/// Where step aggregation of a query happens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AggregationPlan {
    /// The target aggregates and returns one sample per step.
    #[default]
    Server,
    /// The target returns raw samples, which the worker aggregates.
    Client,
}

impl FromStr for AggregationPlan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            other => Err(format!(
                r#"unknown aggregation plan "{other}": expected "server" or "client""#
            )),
        }
    }
}

impl fmt::Display for AggregationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::Client => "client",
        })
    }
}

/// Runs every query against the worker's querier and consumes the full result.
///
/// Timing is split into the phases `select` (until the result stream is available) and `scan`
/// (consuming every series and sample). With [`AggregationPlan::Client`], the time spent
/// aggregating is reported separately as `client-agg`.
#[derive(Debug)]
pub struct QueryHandler {
    querier: BoxedQuerier,
    plan: AggregationPlan,
    raw: Vec<(i64, f64)>,
    samples: u64,
}

impl QueryHandler {
    /// Creates a handler for one worker.
    pub fn new(querier: BoxedQuerier, plan: AggregationPlan) -> Self {
        Self {
            querier,
            plan,
            raw: Vec::new(),
            samples: 0,
        }
    }

    /// Samples returned to this handler so far, after aggregation.
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

#[async_trait::async_trait]
impl Handler for QueryHandler {
    type Item = Query;

    async fn handle(&mut self, query: &Query, phases: &mut Phases) -> Result<()> {
        let client_aggregation = match self.plan {
            AggregationPlan::Server => None,
            AggregationPlan::Client => Some(query.aggregation_type.parse::<Aggregation>()?),
        };
        let selection = Selection {
            metric: &query.metric_name,
            aggregation: match self.plan {
                AggregationPlan::Server => &query.aggregation_type,
                AggregationPlan::Client => "",
            },
            step_millis: match self.plan {
                AggregationPlan::Server => query.step,
                AggregationPlan::Client => 0,
            },
            filter: &query.filter,
            start_millis: query.time_start,
            end_millis: query.time_end,
        };

        let start = Instant::now();
        let mut result = self.querier.select(&selection).await?;
        phases.record("select", start.elapsed());

        let start = Instant::now();
        let mut aggregating = Duration::ZERO;
        while let Some(series) = result.next().await {
            let mut series = series?;
            match client_aggregation {
                None => {
                    while let Some(sample) = series.samples.next().await {
                        sample?;
                        self.samples += 1;
                    }
                }
                Some(aggregation) => {
                    self.raw.clear();
                    while let Some(sample) = series.samples.next().await {
                        self.raw.push(sample?);
                    }

                    let aggregate_start = Instant::now();
                    let buckets = StepAggregator::new(
                        self.raw.iter().copied(),
                        aggregation,
                        query.time_start,
                        query.step,
                    );
                    self.samples += buckets.count() as u64;
                    aggregating += aggregate_start.elapsed();
                }
            }
        }
        phases.record("scan", start.elapsed().saturating_sub(aggregating));
        if client_aggregation.is_some() {
            phases.record("client-agg", aggregating);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::in_memory::InMemoryTsdb;
    use crate::target::{Appender, Labels};

    async fn db() -> InMemoryTsdb {
        let db = InMemoryTsdb::new();
        let mut appender = db.appender();
        for host in 0..4 {
            let labels = Labels::from_pairs([
                ("__name__", "cpu_usage_user".to_owned()),
                ("hostname", format!("host_{host}")),
            ]);
            for second in 0..600i64 {
                appender
                    .add(&labels, second * 1_000_000_000, second as f64)
                    .await
                    .unwrap();
            }
        }
        db
    }

    fn query() -> Query {
        Query {
            human_label: "max".to_owned(),
            metric_name: "cpu_usage_user".to_owned(),
            aggregation_type: "max".to_owned(),
            time_start: 0,
            time_end: 600_000,
            filter: "hostname=='host_1' and hostname=='host_2'".to_owned(),
            step: 60_000,
            ..Default::default()
        }
    }

    fn phase_names(phases: &Phases) -> Vec<&'static str> {
        phases.iter().map(|(name, _)| name).collect()
    }

    #[tokio::test]
    async fn server_plan_scans_aggregated_samples() {
        let db = db().await;
        let mut handler = QueryHandler::new(Box::new(db.querier()), AggregationPlan::Server);
        let mut phases = Phases::default();

        handler.handle(&query(), &mut phases).await.unwrap();

        assert_eq!(handler.samples(), 2 * 10);
        assert_eq!(phase_names(&phases), ["select", "scan"]);
    }

    #[tokio::test]
    async fn client_plan_aggregates_locally() {
        let db = db().await;
        let mut handler = QueryHandler::new(Box::new(db.querier()), AggregationPlan::Client);
        let mut phases = Phases::default();

        handler.handle(&query(), &mut phases).await.unwrap();

        assert_eq!(handler.samples(), 2 * 10);
        assert_eq!(phase_names(&phases), ["select", "scan", "client-agg"]);
    }

    #[tokio::test]
    async fn unknown_aggregation_fails_client_plan() {
        let db = db().await;
        let mut handler = QueryHandler::new(Box::new(db.querier()), AggregationPlan::Client);
        let mut query = query();
        query.aggregation_type = "median".to_owned();

        assert!(handler.handle(&query, &mut Phases::default()).await.is_err());
    }

    #[test]
    fn plan_names() {
        assert_eq!("client".parse::<AggregationPlan>(), Ok(AggregationPlan::Client));
        assert_eq!(AggregationPlan::Server.to_string(), "server");
        assert!("both".parse::<AggregationPlan>().is_err());
    }
}
