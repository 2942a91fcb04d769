//! Turning human-provided member strings into booking-ready records.

use crate::models::{Passenger, PassengerRecord, PassengerType};
use crate::utils::is_number;

/// One requested passenger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberQuery {
    /// Roster code assigned by the service
    ByCode(String),
    /// Passenger name, optionally forced to an adult ticket
    ByName { name: String, force_adult: bool },
}

impl MemberQuery {
    /// `"3"` selects by code, `"*Li Si"` by name with the adult override,
    /// anything else by name.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if is_number(raw) {
            return MemberQuery::ByCode(raw.to_string());
        }
        match raw.strip_prefix('*') {
            Some(name) => MemberQuery::ByName {
                name: name.to_string(),
                force_adult: true,
            },
            None => MemberQuery::ByName {
                name: raw.to_string(),
                force_adult: false,
            },
        }
    }

    /// The identifier as the caller would recognise it in an error.
    pub fn label(&self) -> &str {
        match self {
            MemberQuery::ByCode(code) => code,
            MemberQuery::ByName { name, .. } => name,
        }
    }
}

impl From<&str> for MemberQuery {
    fn from(raw: &str) -> Self {
        MemberQuery::parse(raw)
    }
}

/// Resolve every query against the roster, in order.
///
/// A name that already appears earlier in the results yields a child copy of
/// that record (an adult travelling with a child shares the adult's
/// identity). This check wins over the adult override, so `*name` after
/// `name` still produces a child ticket.
///
/// Returns the first query with no roster match as the error.
pub fn resolve_members<'q>(
    roster: &[Passenger],
    queries: &'q [MemberQuery],
) -> Result<Vec<PassengerRecord>, &'q MemberQuery> {
    let mut results: Vec<PassengerRecord> = Vec::with_capacity(queries.len());

    for query in queries {
        let record = match query {
            MemberQuery::ByCode(code) => roster
                .iter()
                .find(|p| &p.code == code)
                .map(PassengerRecord::from),
            MemberQuery::ByName { name, force_adult } => {
                if let Some(prior) = results.iter().find(|r| &r.name == name) {
                    Some(prior.clone().with_type(PassengerType::Child))
                } else {
                    roster
                        .iter()
                        .find(|p| &p.passenger_name == name)
                        .map(PassengerRecord::from)
                        .map(|r| {
                            if *force_adult {
                                r.with_type(PassengerType::Adult)
                            } else {
                                r
                            }
                        })
                }
            }
        };

        match record {
            Some(record) => results.push(record),
            None => return Err(query),
        }
    }

    Ok(results)
}
