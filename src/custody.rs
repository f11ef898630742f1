use std::collections::HashMap;

/// Roles that can sign in to the daemon. Gating decisions live on this type
/// so handlers never branch on raw role strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Lecturer,
    DepartmentHead,
    Invigilator,
    FacultyOfficer,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "lecturer" => Some(Role::Lecturer),
            "department_head" => Some(Role::DepartmentHead),
            "invigilator" => Some(Role::Invigilator),
            "faculty_officer" => Some(Role::FacultyOfficer),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Lecturer => "lecturer",
            Role::DepartmentHead => "department_head",
            Role::Invigilator => "invigilator",
            Role::FacultyOfficer => "faculty_officer",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    /// Roles that may physically hold a batch and appear on either end of a
    /// transfer.
    pub fn can_hold_custody(&self) -> bool {
        matches!(
            self,
            Role::Lecturer | Role::Invigilator | Role::FacultyOfficer
        )
    }

    pub fn can_manage_sessions(&self) -> bool {
        matches!(self, Role::Admin | Role::Lecturer | Role::DepartmentHead)
    }

    pub fn can_resolve_discrepancies(&self) -> bool {
        matches!(self, Role::Admin | Role::FacultyOfficer)
    }
}

/// Batch lifecycle. The numeric rank orders the canonical progression; a
/// status update may only move to an equal or higher rank (admins excepted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    NotStarted,
    InProgress,
    Submitted,
    InTransit,
    WithLecturer,
    UnderGrading,
    Graded,
    Returned,
    Completed,
}

impl SessionStatus {
    pub fn parse(s: &str) -> Option<SessionStatus> {
        match s {
            "not_started" => Some(SessionStatus::NotStarted),
            "in_progress" => Some(SessionStatus::InProgress),
            "submitted" => Some(SessionStatus::Submitted),
            "in_transit" => Some(SessionStatus::InTransit),
            "with_lecturer" => Some(SessionStatus::WithLecturer),
            "under_grading" => Some(SessionStatus::UnderGrading),
            "graded" => Some(SessionStatus::Graded),
            "returned" => Some(SessionStatus::Returned),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::NotStarted => "not_started",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Submitted => "submitted",
            SessionStatus::InTransit => "in_transit",
            SessionStatus::WithLecturer => "with_lecturer",
            SessionStatus::UnderGrading => "under_grading",
            SessionStatus::Graded => "graded",
            SessionStatus::Returned => "returned",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            SessionStatus::NotStarted => 0,
            SessionStatus::InProgress => 1,
            SessionStatus::Submitted => 2,
            SessionStatus::InTransit => 3,
            SessionStatus::WithLecturer => 4,
            SessionStatus::UnderGrading => 5,
            SessionStatus::Graded => 6,
            SessionStatus::Returned => 7,
            SessionStatus::Completed => 8,
        }
    }
}

/// Forward moves (including skips and same-status no-ops) are always legal.
/// Backward moves are clerical corrections reserved for admins.
pub fn session_transition_allowed(from: SessionStatus, to: SessionStatus, actor: Role) -> bool {
    to.rank() >= from.rank() || actor.is_admin()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Confirmed,
    DiscrepancyReported,
    Resolved,
    Cancelled,
}

impl TransferStatus {
    pub fn parse(s: &str) -> Option<TransferStatus> {
        match s {
            "pending" => Some(TransferStatus::Pending),
            "confirmed" => Some(TransferStatus::Confirmed),
            "discrepancy_reported" => Some(TransferStatus::DiscrepancyReported),
            "resolved" => Some(TransferStatus::Resolved),
            "cancelled" => Some(TransferStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Confirmed => "confirmed",
            TransferStatus::DiscrepancyReported => "discrepancy_reported",
            TransferStatus::Resolved => "resolved",
            TransferStatus::Cancelled => "cancelled",
        }
    }
}

/// A received count equal to the expected count confirms cleanly; any
/// mismatch is a discrepancy, never a silent confirm.
pub fn confirm_outcome(exams_expected: i64, exams_received: i64) -> TransferStatus {
    if exams_received == exams_expected {
        TransferStatus::Confirmed
    } else {
        TransferStatus::DiscrepancyReported
    }
}

/// The slice of a transfer row the custody derivation needs.
#[derive(Debug, Clone)]
pub struct TransferFacts {
    pub id: String,
    pub session_id: String,
    pub from_handler_id: String,
    pub to_handler_id: String,
    pub status: TransferStatus,
    /// RFC3339; lexicographic order is chronological order.
    pub requested_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustodyState {
    InCustody,
    PendingReceipt,
    TransferInitiated,
    Unknown,
}

impl CustodyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustodyState::InCustody => "in_custody",
            CustodyState::PendingReceipt => "pending_receipt",
            CustodyState::TransferInitiated => "transfer_initiated",
            CustodyState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionCustody {
    pub session_id: String,
    pub state: CustodyState,
    pub pending_transfer_count: usize,
    pub latest_transfer_id: String,
}

/// How the latest transfer in a session reads from one handler's point of
/// view. Cases that match neither end of the transfer are reported as
/// Unknown rather than being folded into InCustody.
pub fn classify_for_viewer(viewer_id: &str, latest: &TransferFacts) -> CustodyState {
    match latest.status {
        TransferStatus::Pending if latest.to_handler_id == viewer_id => {
            CustodyState::PendingReceipt
        }
        TransferStatus::Pending if latest.from_handler_id == viewer_id => {
            CustodyState::TransferInitiated
        }
        TransferStatus::Confirmed | TransferStatus::Resolved
            if latest.to_handler_id == viewer_id =>
        {
            CustodyState::InCustody
        }
        _ => CustodyState::Unknown,
    }
}

fn newer(a: &TransferFacts, b: &TransferFacts) -> bool {
    // Tie-break on id so the pick is stable when two requests share a stamp.
    (a.requested_at.as_str(), a.id.as_str()) > (b.requested_at.as_str(), b.id.as_str())
}

/// Group one handler's transfers by session and classify the latest per
/// group. Output is ordered newest session activity first.
pub fn derive_overview(viewer_id: &str, transfers: &[TransferFacts]) -> Vec<SessionCustody> {
    let mut latest_by_session: HashMap<&str, &TransferFacts> = HashMap::new();
    let mut pending_by_session: HashMap<&str, usize> = HashMap::new();

    for t in transfers {
        if t.status == TransferStatus::Pending {
            *pending_by_session.entry(t.session_id.as_str()).or_insert(0) += 1;
        }
        match latest_by_session.get(t.session_id.as_str()) {
            Some(cur) if !newer(t, cur) => {}
            _ => {
                latest_by_session.insert(t.session_id.as_str(), t);
            }
        }
    }

    let mut out: Vec<SessionCustody> = latest_by_session
        .values()
        .map(|latest| SessionCustody {
            session_id: latest.session_id.clone(),
            state: classify_for_viewer(viewer_id, latest),
            pending_transfer_count: pending_by_session
                .get(latest.session_id.as_str())
                .copied()
                .unwrap_or(0),
            latest_transfer_id: latest.id.clone(),
        })
        .collect();

    out.sort_by(|a, b| {
        let ka = latest_by_session
            .get(a.session_id.as_str())
            .map(|t| (t.requested_at.as_str(), t.id.as_str()));
        let kb = latest_by_session
            .get(b.session_id.as_str())
            .map(|t| (t.requested_at.as_str(), t.id.as_str()));
        kb.cmp(&ka)
    });
    out
}

/// Current custodian of one session: the receiving handler on the most
/// recently requested CONFIRMED transfer, or none before first confirmation.
pub fn current_custodian<'a>(transfers: &'a [TransferFacts]) -> Option<&'a str> {
    transfers
        .iter()
        .filter(|t| t.status == TransferStatus::Confirmed)
        .fold(None::<&TransferFacts>, |best, t| match best {
            Some(b) if !newer(t, b) => Some(b),
            _ => Some(t),
        })
        .map(|t| t.to_handler_id.as_str())
}
