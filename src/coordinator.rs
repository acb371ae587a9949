//! The read/fan-out loop (C4) and the outcome type returned to callers.

use tokio_util::sync::CancellationToken;

use crate::branch::{BranchState, WriteOutcome};
use crate::config::SourceConfig;
use crate::error::BifurcationError;
use crate::source::Source;

/// Result of a [`crate::bifurcate`] call.
///
/// `results` is always positionally aligned with the branch configs passed
/// in: `results[i]` is `Some` iff branch `i` produced a value before the
/// call ended (voluntarily, by quota, or — when `error` is set — before the
/// fanout reached it). `error` is set when the underlying run failed but
/// `SourceConfig::bubble_exceptions` was `false`, so the failure is
/// reported here instead of via `Err`.
#[derive(Debug)]
pub struct BifurcateOutcome<R> {
    pub results: Vec<Option<R>>,
    pub error: Option<BifurcationError>,
}

/// Drive `source` to completion, fanning its bytes out to `branches`, and
/// produce the aligned result set or the wrapped failure.
pub(crate) async fn run<S, R>(
    mut source: S,
    source_config: SourceConfig,
    mut branches: Vec<BranchState<R>>,
) -> Result<BifurcateOutcome<R>, BifurcationError>
where
    S: Source,
    R: Send + 'static,
{
    let cancel = source_config.cancel_token.clone();
    let mut results: Vec<Option<R>> = branches.iter().map(|_| None).collect();

    let run_result =
        drive_to_completion(&mut source, &source_config, &mut branches, &mut results, &cancel)
            .await;

    let fault = match run_result {
        Ok(()) => {
            source.close_ok().await;
            let mut fault = None;
            for (i, branch) in branches.iter_mut().enumerate() {
                match branch.complete_ok().await {
                    Ok(Some(value)) => results[i] = Some(value),
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(
                            branch = %branch.id(),
                            %err,
                            "branch failed during final completion"
                        );
                        // Leave every branch from here on un-closed: the
                        // failure-fanout loop below must still call
                        // `complete_err` on them so their readers observe
                        // the failure and their own `on_error` gets a
                        // chance to fire, instead of silently finishing
                        // them here via `complete_ok`.
                        fault = Some(err);
                        break;
                    }
                }
            }
            fault
        }
        Err(err) => Some(err),
    };

    match fault {
        None => Ok(BifurcateOutcome {
            results,
            error: None,
        }),
        Some(err) => {
            tracing::warn!(kind = ?err.kind(), %err, "bifurcation failed; fanning out to all branches");
            // `err` is built exactly once, at the point the fault was first
            // detected above (or inside `drive_to_completion`/the final
            // completion sweep) — it's cloned (an `Arc` bump, see
            // `BifurcationError`) to every branch's buffer and to the
            // caller, never rewrapped into a second `BifurcationError`.
            source.close_err(&err).await;
            for (i, branch) in branches.iter_mut().enumerate() {
                if let Some(value) = branch.complete_err(err.clone()).await {
                    results[i] = Some(value);
                }
            }
            if source_config.bubble_exceptions {
                Err(err)
            } else {
                Ok(BifurcateOutcome {
                    results,
                    error: Some(err),
                })
            }
        }
    }
}

/// The steady-state read/write loop. Returns `Ok(())` once the source is
/// exhausted or every branch has completed, or `Err` on the first failure
/// (source read error, consumer fault, or cancellation).
async fn drive_to_completion<S, R>(
    source: &mut S,
    source_config: &SourceConfig,
    branches: &mut [BranchState<R>],
    results: &mut [Option<R>],
    cancel: &CancellationToken,
) -> Result<(), BifurcationError>
where
    S: Source,
    R: Send + 'static,
{
    let min_read_buffer_size = source_config.min_read_buffer_size;
    let mut completed_count = branches.iter().filter(|b| b.is_stopped()).count();

    loop {
        if completed_count == branches.len() {
            return Ok(());
        }

        let (view, source_completed) = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BifurcationError::cancelled()),
            result = source.peek() => result?,
        };

        if view.is_empty() && source_completed {
            return Ok(());
        }

        if !source_completed && min_read_buffer_size.is_some_and(|min| view.len() < min) {
            let len = view.len();
            source.advance_examined(len);
            continue;
        }

        let total = branches.len();
        for (i, branch) in branches.iter_mut().enumerate() {
            if branch.is_stopped() {
                continue;
            }
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(BifurcationError::cancelled()),
                outcome = branch.write(view) => outcome,
            };
            match outcome {
                WriteOutcome::Continue => {}
                WriteOutcome::Stop => {
                    match branch.complete_ok().await {
                        Ok(Some(value)) => results[i] = Some(value),
                        Ok(None) => {}
                        Err(err) => return Err(err),
                    }
                    completed_count += 1;
                    tracing::debug!(
                        branch = %branch.id(),
                        completed_count,
                        total,
                        "branch completed"
                    );
                }
                WriteOutcome::Fault(err) => return Err(err),
            }
        }

        if completed_count == branches.len() {
            return Ok(());
        }

        let len = view.len();
        source.advance_consumed(len);
    }
}
