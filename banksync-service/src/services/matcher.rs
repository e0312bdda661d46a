//! Reconciliation matcher.
//!
//! Given a newly ingested bank movement, searches open obligations for an
//! exact amount match and proposes a link. Ambiguity is never resolved
//! automatically: a movement with several equally plausible candidates
//! stays `unmatched` for a human to resolve, and a `suggested` link only
//! becomes `matched` through the explicit confirmation operation.

use crate::models::{BankMovement, ObligationCandidate};
use crate::services::database::Database;
use crate::services::metrics::{record_error, record_match_outcome};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of evaluating one movement against the candidate set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchDecision {
    /// No amount-equal unsettled obligation exists.
    NoMatch,
    /// Exactly one plausible candidate; proposed as `suggested`.
    Suggest(ObligationCandidate),
    /// Two or more candidates tied after date narrowing. Needs human review.
    Ambiguous(Vec<ObligationCandidate>),
}

/// Pure tie-break policy over amount-equal candidates.
///
/// Exactly one candidate wins outright. Several are narrowed by closest
/// due/issue date to the movement's booking date; if the closest distance is
/// shared the tie is reported, not guessed.
pub fn evaluate_candidates(
    movement_amount: Decimal,
    movement_currency: &str,
    booking_date: chrono::NaiveDate,
    candidates: Vec<ObligationCandidate>,
) -> MatchDecision {
    let target = movement_amount.abs();

    let mut eligible: Vec<ObligationCandidate> = candidates
        .into_iter()
        .filter(|c| c.expected_amount == target && c.currency == movement_currency)
        .collect();

    match eligible.len() {
        0 => MatchDecision::NoMatch,
        1 => MatchDecision::Suggest(eligible.remove(0)),
        _ => {
            let distance = |c: &ObligationCandidate| {
                (c.reference_date - booking_date).num_days().abs()
            };
            let best = eligible.iter().map(distance).min().unwrap_or(0);
            let mut closest: Vec<ObligationCandidate> = eligible
                .into_iter()
                .filter(|c| distance(c) == best)
                .collect();
            if closest.len() == 1 {
                MatchDecision::Suggest(closest.remove(0))
            } else {
                MatchDecision::Ambiguous(closest)
            }
        }
    }
}

/// Drops candidates the reviewer already dismissed for this movement.
fn exclude_rejected(
    candidates: Vec<ObligationCandidate>,
    rejected: &[(String, Uuid)],
) -> Vec<ObligationCandidate> {
    candidates
        .into_iter()
        .filter(|c| {
            !rejected
                .iter()
                .any(|(kind, id)| kind == c.kind && *id == c.obligation_id)
        })
        .collect()
}

#[derive(Clone)]
pub struct Matcher {
    db: Arc<Database>,
}

impl Matcher {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Evaluate a newly ingested movement and persist the outcome.
    ///
    /// The amount's sign picks the obligation universe: incoming money is
    /// searched against open invoices, outgoing against pending recurring
    /// instances. Candidates previously rejected for this movement are
    /// excluded up front.
    pub async fn match_movement(
        &self,
        movement: &BankMovement,
    ) -> Result<MatchDecision, AppError> {
        let target = movement.amount.abs();

        let candidates = if movement.amount > Decimal::ZERO {
            self.db
                .find_receivable_candidates(movement.tenant_id, target, &movement.currency)
                .await?
        } else if movement.amount < Decimal::ZERO {
            self.db
                .find_payable_candidates(movement.tenant_id, target, &movement.currency)
                .await?
        } else {
            // Zero-amount informational entries never settle anything.
            record_match_outcome("no_match");
            return Ok(MatchDecision::NoMatch);
        };

        let rejected = self.db.list_rejected_candidates(movement.movement_id).await?;
        let candidates = exclude_rejected(candidates, &rejected);

        let decision = evaluate_candidates(
            movement.amount,
            &movement.currency,
            movement.booking_date,
            candidates,
        );

        match &decision {
            MatchDecision::Suggest(candidate) => {
                let updated = self
                    .db
                    .set_movement_suggestion(movement.movement_id, candidate)
                    .await?;
                if updated.is_some() {
                    record_match_outcome("suggested");
                    tracing::info!(
                        movement_id = %movement.movement_id,
                        obligation_id = %candidate.obligation_id,
                        obligation_kind = candidate.kind,
                        "Match suggested"
                    );
                } else {
                    // Movement left `unmatched` in the meantime (manual
                    // action won the race); nothing to record.
                    record_match_outcome("skipped");
                }
            }
            MatchDecision::Ambiguous(tied) => {
                record_match_outcome("ambiguous");
                tracing::info!(
                    movement_id = %movement.movement_id,
                    tied_candidates = tied.len(),
                    "Ambiguous match left for manual resolution"
                );
            }
            MatchDecision::NoMatch => {
                record_match_outcome("no_match");
            }
        }

        Ok(decision)
    }

    /// Human confirmation of a suggested link. Marks the movement `matched`
    /// and settles the obligation in one transaction.
    pub async fn confirm_suggestion(
        &self,
        tenant_id: Uuid,
        movement_id: Uuid,
    ) -> Result<BankMovement, AppError> {
        let movement = self.db.confirm_movement_match(tenant_id, movement_id).await?;
        record_match_outcome("confirmed");
        Ok(movement)
    }

    /// Human rejection of a suggested link. The movement returns to
    /// `unmatched`, the candidate is recorded so it is never re-suggested,
    /// and the matcher runs again so the next-best candidate (if any) is
    /// proposed immediately.
    pub async fn reject_suggestion(
        &self,
        tenant_id: Uuid,
        movement_id: Uuid,
    ) -> Result<BankMovement, AppError> {
        let movement = self
            .db
            .reject_movement_suggestion(tenant_id, movement_id)
            .await?;
        record_match_outcome("rejected");

        // Re-matching is best-effort: the rejection itself already
        // succeeded, so a matcher failure here leaves the movement
        // `unmatched` rather than failing the request.
        match self.match_movement(&movement).await {
            Ok(MatchDecision::Suggest(_)) => Ok(self
                .db
                .get_movement(tenant_id, movement_id)
                .await?
                .unwrap_or(movement)),
            Ok(_) => Ok(movement),
            Err(e) => {
                record_error("match_failed");
                tracing::warn!(
                    movement_id = %movement_id,
                    error = %e,
                    "Re-match after rejection failed"
                );
                Ok(movement)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObligationKind;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn invoice_candidate(amount: &str, reference_date: NaiveDate) -> ObligationCandidate {
        ObligationCandidate {
            obligation_id: Uuid::new_v4(),
            kind: ObligationKind::InvoiceReceivable.as_str(),
            expected_amount: dec(amount),
            currency: "EUR".to_string(),
            reference_date,
            counterparty_name: "Acme GmbH".to_string(),
        }
    }

    fn recurring_candidate(amount: &str, reference_date: NaiveDate) -> ObligationCandidate {
        ObligationCandidate {
            obligation_id: Uuid::new_v4(),
            kind: ObligationKind::RecurringPayable.as_str(),
            expected_amount: dec(amount),
            currency: "EUR".to_string(),
            reference_date,
            counterparty_name: "Office rent".to_string(),
        }
    }

    #[test]
    fn no_candidates_means_no_match() {
        let decision = evaluate_candidates(dec("120.00"), "EUR", date(2024, 8, 10), vec![]);
        assert_eq!(decision, MatchDecision::NoMatch);
    }

    #[test]
    fn amount_mismatch_is_filtered_out() {
        let candidates = vec![invoice_candidate("120.01", date(2024, 8, 10))];
        let decision =
            evaluate_candidates(dec("120.00"), "EUR", date(2024, 8, 10), candidates);
        assert_eq!(decision, MatchDecision::NoMatch);
    }

    #[test]
    fn currency_mismatch_is_filtered_out() {
        let mut candidate = invoice_candidate("120.00", date(2024, 8, 10));
        candidate.currency = "USD".to_string();
        let decision =
            evaluate_candidates(dec("120.00"), "EUR", date(2024, 8, 10), vec![candidate]);
        assert_eq!(decision, MatchDecision::NoMatch);
    }

    #[test]
    fn single_amount_equal_candidate_is_suggested() {
        let candidate = invoice_candidate("120.00", date(2024, 8, 20));
        let decision = evaluate_candidates(
            dec("120.00"),
            "EUR",
            date(2024, 8, 10),
            vec![candidate.clone()],
        );
        assert_eq!(decision, MatchDecision::Suggest(candidate));
    }

    #[test]
    fn negative_amount_matches_on_absolute_value() {
        let candidate = recurring_candidate("45.00", date(2024, 8, 12));
        let decision = evaluate_candidates(
            dec("-45.00"),
            "EUR",
            date(2024, 8, 10),
            vec![candidate.clone()],
        );
        assert_eq!(decision, MatchDecision::Suggest(candidate));
    }

    #[test]
    fn closer_reference_date_wins_among_equals() {
        // Invoice due in 2 days vs. recurring instance due in 10 days.
        let near = invoice_candidate("120.00", date(2024, 8, 12));
        let far = recurring_candidate("120.00", date(2024, 8, 20));
        let decision = evaluate_candidates(
            dec("120.00"),
            "EUR",
            date(2024, 8, 10),
            vec![far, near.clone()],
        );
        assert_eq!(decision, MatchDecision::Suggest(near));
    }

    #[test]
    fn date_distance_is_absolute() {
        // Two days in the past beats five days in the future.
        let past = invoice_candidate("80.00", date(2024, 8, 8));
        let future = invoice_candidate("80.00", date(2024, 8, 15));
        let decision = evaluate_candidates(
            dec("80.00"),
            "EUR",
            date(2024, 8, 10),
            vec![future, past.clone()],
        );
        assert_eq!(decision, MatchDecision::Suggest(past));
    }

    #[test]
    fn equal_dates_stay_ambiguous() {
        let a = invoice_candidate("120.00", date(2024, 8, 12));
        let b = invoice_candidate("120.00", date(2024, 8, 12));
        let decision = evaluate_candidates(
            dec("120.00"),
            "EUR",
            date(2024, 8, 10),
            vec![a.clone(), b.clone()],
        );
        match decision {
            MatchDecision::Ambiguous(tied) => {
                assert_eq!(tied.len(), 2);
                assert!(tied.contains(&a));
                assert!(tied.contains(&b));
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn rejected_candidate_is_excluded_and_next_best_wins() {
        // The previously dismissed invoice would win on date; once excluded
        // the remaining candidate is proposed instead.
        let dismissed = invoice_candidate("120.00", date(2024, 8, 11));
        let next_best = recurring_candidate("120.00", date(2024, 8, 20));
        let rejected = vec![(dismissed.kind.to_string(), dismissed.obligation_id)];

        let remaining = exclude_rejected(vec![dismissed, next_best.clone()], &rejected);
        let decision = evaluate_candidates(dec("120.00"), "EUR", date(2024, 8, 10), remaining);
        assert_eq!(decision, MatchDecision::Suggest(next_best));
    }

    #[test]
    fn rejecting_the_only_candidate_leaves_no_match() {
        let dismissed = invoice_candidate("120.00", date(2024, 8, 11));
        let rejected = vec![(dismissed.kind.to_string(), dismissed.obligation_id)];

        let remaining = exclude_rejected(vec![dismissed], &rejected);
        let decision = evaluate_candidates(dec("120.00"), "EUR", date(2024, 8, 10), remaining);
        assert_eq!(decision, MatchDecision::NoMatch);
    }

    #[test]
    fn exclusion_matches_on_kind_and_id_together() {
        // Same id under a different obligation kind is a different candidate.
        let candidate = invoice_candidate("60.00", date(2024, 8, 12));
        let rejected = vec![(
            ObligationKind::RecurringPayable.as_str().to_string(),
            candidate.obligation_id,
        )];

        let remaining = exclude_rejected(vec![candidate.clone()], &rejected);
        assert_eq!(remaining, vec![candidate]);
    }

    #[test]
    fn three_way_tie_narrows_to_the_two_closest() {
        let closest_a = invoice_candidate("60.00", date(2024, 8, 11));
        let closest_b = invoice_candidate("60.00", date(2024, 8, 9));
        let far = invoice_candidate("60.00", date(2024, 8, 25));
        let decision = evaluate_candidates(
            dec("60.00"),
            "EUR",
            date(2024, 8, 10),
            vec![far, closest_a.clone(), closest_b.clone()],
        );
        match decision {
            MatchDecision::Ambiguous(tied) => {
                assert_eq!(tied.len(), 2);
                assert!(tied.contains(&closest_a));
                assert!(tied.contains(&closest_b));
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }
}
