//! Minimal demo-bank ledger
//!
//! Just enough book-keeping for the EBICS host: accounts, booked entries,
//! and camt.053 statement rendering over a date range. Statement message
//! ids are a stable function of account and range, so a client fetching
//! the same range twice sees the same bank message id and can deduplicate.

use chrono::{DateTime, NaiveDate, Utc};
use moneta_iso20022::{Direction, PaymentInitiation};
use moneta_xml::Element;
use rust_decimal::Decimal;

/// One account held at the demo bank.
#[derive(Debug, Clone)]
pub struct DemoAccount {
    pub iban: String,
    pub bic: String,
    pub holder: String,
    pub currency: String,
}

/// One booked ledger movement.
#[derive(Debug, Clone)]
pub struct BookedEntry {
    pub entry_ref: String,
    pub account_iban: String,
    pub amount: Decimal,
    pub direction: Direction,
    pub subject: String,
    pub end_to_end_id: Option<String>,
    pub counterpart_name: String,
    pub counterpart_iban: String,
    pub booked_at: DateTime<Utc>,
}

/// The demo bank's books.
#[derive(Debug)]
pub struct DemoLedger {
    accounts: Vec<DemoAccount>,
    entries: Vec<BookedEntry>,
    /// The only currency this bank settles in
    accepted_currency: String,
    entry_counter: u64,
}

impl DemoLedger {
    pub fn new(accepted_currency: impl Into<String>) -> Self {
        Self {
            accounts: Vec::new(),
            entries: Vec::new(),
            accepted_currency: accepted_currency.into(),
            entry_counter: 0,
        }
    }

    pub fn accepted_currency(&self) -> &str {
        &self.accepted_currency
    }

    pub fn add_account(&mut self, account: DemoAccount) {
        self.accounts.push(account);
    }

    pub fn account(&self, iban: &str) -> Option<&DemoAccount> {
        self.accounts.iter().find(|a| a.iban == iban)
    }

    fn next_entry_ref(&mut self) -> String {
        self.entry_counter += 1;
        format!("S-{:06}", self.entry_counter)
    }

    /// Book a validated credit transfer: a debit on the debtor account,
    /// and a matching credit when the creditor also banks here.
    pub fn book_credit_transfer(&mut self, payment: &PaymentInitiation, now: DateTime<Utc>) {
        let end_to_end = payment.end_to_end_id.clone();

        let debit_ref = self.next_entry_ref();
        self.entries.push(BookedEntry {
            entry_ref: debit_ref,
            account_iban: payment.debtor_iban.clone(),
            amount: payment.amount,
            direction: Direction::Debit,
            subject: payment.subject.clone(),
            end_to_end_id: end_to_end.clone(),
            counterpart_name: payment.creditor_name.clone(),
            counterpart_iban: payment.creditor_iban.clone(),
            booked_at: now,
        });

        if self.account(&payment.creditor_iban).is_some() {
            let credit_ref = self.next_entry_ref();
            self.entries.push(BookedEntry {
                entry_ref: credit_ref,
                account_iban: payment.creditor_iban.clone(),
                amount: payment.amount,
                direction: Direction::Credit,
                subject: payment.subject.clone(),
                end_to_end_id: end_to_end,
                counterpart_name: payment.debtor_name.clone(),
                counterpart_iban: payment.debtor_iban.clone(),
                booked_at: now,
            });
        }
    }

    /// Directly book an incoming credit (test seam for statement content).
    pub fn book_incoming(
        &mut self,
        account_iban: &str,
        amount: Decimal,
        subject: &str,
        counterpart_name: &str,
        counterpart_iban: &str,
        now: DateTime<Utc>,
    ) {
        let entry_ref = self.next_entry_ref();
        self.entries.push(BookedEntry {
            entry_ref,
            account_iban: account_iban.to_string(),
            amount,
            direction: Direction::Credit,
            subject: subject.to_string(),
            end_to_end_id: None,
            counterpart_name: counterpart_name.to_string(),
            counterpart_iban: counterpart_iban.to_string(),
            booked_at: now,
        });
    }

    /// Render camt.053 statements for the given accounts over a date
    /// range (inclusive). Accounts without movements yield nothing.
    pub fn statements(
        &self,
        account_ibans: &[String],
        range: Option<(NaiveDate, NaiveDate)>,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for iban in account_ibans {
            let Some(account) = self.account(iban) else {
                continue;
            };
            let in_range: Vec<&BookedEntry> = self
                .entries
                .iter()
                .filter(|e| {
                    e.account_iban == *iban
                        && match range {
                            Some((start, end)) => {
                                let day = e.booked_at.date_naive();
                                day >= start && day <= end
                            }
                            None => true,
                        }
                })
                .collect();
            if in_range.is_empty() {
                continue;
            }

            let opening: Decimal = self
                .entries
                .iter()
                .filter(|e| {
                    e.account_iban == *iban
                        && match range {
                            Some((start, _)) => e.booked_at.date_naive() < start,
                            None => false,
                        }
                })
                .map(signed)
                .sum();
            let closing: Decimal = opening + in_range.iter().map(|e| signed(e)).sum::<Decimal>();

            // One logical statement per account and end date; a client
            // fetching overlapping ranges sees the same message id and
            // deduplicates.
            let message_id = match range {
                Some((_, end)) => format!("C53-{}-{}", iban, end),
                None => format!("C53-{}-full", iban),
            };
            let xml =
                build_camt053(account, &in_range, opening, closing, &message_id, now).to_document();
            out.push((message_id, xml));
        }
        out
    }
}

fn signed(entry: &BookedEntry) -> Decimal {
    match entry.direction {
        Direction::Credit => entry.amount,
        Direction::Debit => -entry.amount,
    }
}

fn balance_element(code: &str, amount: Decimal, currency: &str, date: NaiveDate) -> Element {
    let (indicator, magnitude) = if amount < Decimal::ZERO {
        ("DBIT", -amount)
    } else {
        ("CRDT", amount)
    };
    Element::new("Bal")
        .child(
            Element::new("Tp")
                .child(Element::new("CdOrPrtry").child(Element::leaf("Cd", code))),
        )
        .child(
            Element::new("Amt")
                .attr("Ccy", currency)
                .text(magnitude.to_string()),
        )
        .child(Element::leaf("CdtDbtInd", indicator))
        .child(
            Element::new("Dt").child(Element::leaf("Dt", date.format("%Y-%m-%d").to_string())),
        )
}

fn build_camt053(
    account: &DemoAccount,
    entries: &[&BookedEntry],
    opening: Decimal,
    closing: Decimal,
    message_id: &str,
    now: DateTime<Utc>,
) -> Element {
    let today = now.date_naive();
    let mut stmt = Element::new("Stmt")
        .child(Element::leaf("Id", format!("{}-stmt", message_id)))
        .child(Element::leaf(
            "CreDtTm",
            now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        ))
        .child(
            Element::new("Acct").child(
                Element::new("Id").child(Element::leaf("IBAN", &account.iban)),
            ),
        )
        .child(balance_element("OPBD", opening, &account.currency, today))
        .child(balance_element("CLBD", closing, &account.currency, today));

    for entry in entries {
        let (party_tag, account_tag) = match entry.direction {
            Direction::Credit => ("Dbtr", "DbtrAcct"),
            Direction::Debit => ("Cdtr", "CdtrAcct"),
        };
        let mut tx_details = Element::new("TxDtls");
        if let Some(end_to_end) = &entry.end_to_end_id {
            tx_details = tx_details.child(
                Element::new("Refs").child(Element::leaf("EndToEndId", end_to_end)),
            );
        }
        tx_details = tx_details
            .child(
                Element::new("RltdPties")
                    .child(
                        Element::new(party_tag)
                            .child(Element::leaf("Nm", &entry.counterpart_name)),
                    )
                    .child(Element::new(account_tag).child(
                        Element::new("Id").child(Element::leaf("IBAN", &entry.counterpart_iban)),
                    )),
            )
            .child(Element::new("RmtInf").child(Element::leaf("Ustrd", &entry.subject)));

        let booking_day = entry.booked_at.date_naive().format("%Y-%m-%d").to_string();
        stmt = stmt.child(
            Element::new("Ntry")
                .child(Element::leaf("NtryRef", &entry.entry_ref))
                .child(
                    Element::new("Amt")
                        .attr("Ccy", &account.currency)
                        .text(entry.amount.to_string()),
                )
                .child(Element::leaf("CdtDbtInd", entry.direction.as_camt()))
                .child(Element::leaf("Sts", "BOOK"))
                .child(Element::new("BookgDt").child(Element::leaf("Dt", booking_day.clone())))
                .child(Element::new("ValDt").child(Element::leaf("Dt", booking_day)))
                .child(
                    Element::new("BkTxCd").child(
                        Element::new("Domn")
                            .child(Element::leaf("Cd", "PMNT"))
                            .child(
                                Element::new("Fmly")
                                    .child(Element::leaf(
                                        "Cd",
                                        match entry.direction {
                                            Direction::Credit => "RCDT",
                                            Direction::Debit => "ICDT",
                                        },
                                    ))
                                    .child(Element::leaf("SubFmlyCd", "ESCT")),
                            ),
                    ),
                )
                .child(Element::new("NtryDtls").child(tx_details)),
        );
    }

    Element::new("Document")
        .attr("xmlns", "urn:iso:std:iso:20022:tech:xsd:camt.053.001.02")
        .child(
            Element::new("BkToCstmrStmt")
                .child(
                    Element::new("GrpHdr")
                        .child(Element::leaf("MsgId", message_id))
                        .child(Element::leaf(
                            "CreDtTm",
                            now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                        )),
                )
                .child(stmt),
        )
}
