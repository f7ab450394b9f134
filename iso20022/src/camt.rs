//! camt.052 / camt.053 parsing
//!
//! Flattens account reports and statements into the normalized
//! transaction model. One camt entry yields one normalized transaction;
//! batch entries (more than one `TxDtls`) merge their remittance lines in
//! document order and are flagged as batches.

use crate::transactions::{
    BankTransactionCode, Direction, EntryStatus, NormalizedTransaction,
};
use crate::{Error, Result};
use moneta_xml::Element;
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::warn;

/// Which camt flavor a document turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CamtKind {
    /// camt.052, intraday account report
    Report,
    /// camt.053, end-of-day statement
    Statement,
}

/// One `Rpt`/`Stmt` block.
#[derive(Debug, Clone)]
pub struct CamtStatement {
    pub account_iban: String,
    /// OPBD balance, signed (debit balances negative)
    pub opening_balance: Option<Decimal>,
    /// CLBD balance, signed
    pub closing_balance: Option<Decimal>,
    pub transactions: Vec<NormalizedTransaction>,
}

/// A parsed camt document.
#[derive(Debug, Clone)]
pub struct CamtDocument {
    /// Bank-assigned message id (`GrpHdr/MsgId`); the dedup key
    pub message_id: String,
    pub kind: CamtKind,
    pub statements: Vec<CamtStatement>,
}

impl CamtDocument {
    /// All transactions across all statements.
    pub fn transactions(&self) -> impl Iterator<Item = &NormalizedTransaction> {
        self.statements.iter().flat_map(|s| s.transactions.iter())
    }
}

/// Parse a camt.052 or camt.053 document.
pub fn parse_camt(xml: &str) -> Result<CamtDocument> {
    let doc = Element::parse(xml)?;
    if doc.local_name() != "Document" {
        return Err(Error::CamtParse(format!(
            "expected camt root 'Document', found '{}'",
            doc.local_name()
        )));
    }

    let mut containers = doc.child_elements();
    let container = containers
        .next()
        .ok_or_else(|| Error::CamtParse("empty camt Document".to_string()))?;
    if containers.next().is_some() {
        return Err(Error::CamtParse(
            "camt Document with more than one child".to_string(),
        ));
    }

    let (kind, statement_tag) = match container.local_name() {
        "BkToCstmrAcctRpt" => (CamtKind::Report, "Rpt"),
        "BkToCstmrStmt" => (CamtKind::Statement, "Stmt"),
        other => {
            return Err(Error::CamtParse(format!(
                "unsupported camt message '{}'",
                other
            )))
        }
    };

    let message_id = container
        .require_unique_child("GrpHdr")?
        .require_child_text("MsgId")?;

    let mut statements = Vec::new();
    for stmt in container
        .child_elements()
        .filter(|el| el.local_name() == statement_tag)
    {
        statements.push(parse_statement(stmt, &message_id)?);
    }

    Ok(CamtDocument {
        message_id,
        kind,
        statements,
    })
}

fn parse_statement(stmt: &Element, message_id: &str) -> Result<CamtStatement> {
    let account_iban = stmt
        .require_unique_child("Acct")?
        .require_unique_child("Id")?
        .require_child_text("IBAN")?;

    let mut opening_balance = None;
    let mut closing_balance = None;
    for bal in stmt.child_elements().filter(|el| el.local_name() == "Bal") {
        let code = bal
            .require_unique_child("Tp")?
            .require_unique_child("CdOrPrtry")?
            .maybe_child_text("Cd")?;
        let amount = parse_decimal(&bal.require_unique_child("Amt")?.trimmed_text())?;
        let signed = match Direction::from_camt(&bal.require_child_text("CdtDbtInd")?)? {
            Direction::Credit => amount,
            Direction::Debit => -amount,
        };
        match code.as_deref() {
            Some("OPBD") => opening_balance = Some(signed),
            Some("CLBD") => closing_balance = Some(signed),
            _ => {}
        }
    }

    let mut transactions = Vec::new();
    for (index, ntry) in stmt
        .child_elements()
        .filter(|el| el.local_name() == "Ntry")
        .enumerate()
    {
        transactions.push(parse_entry(ntry, &account_iban, message_id, index)?);
    }

    Ok(CamtStatement {
        account_iban,
        opening_balance,
        closing_balance,
        transactions,
    })
}

fn parse_entry(
    ntry: &Element,
    account_iban: &str,
    message_id: &str,
    index: usize,
) -> Result<NormalizedTransaction> {
    let amt_el = ntry.require_unique_child("Amt")?;
    let amount = parse_decimal(&amt_el.trimmed_text())?;
    let currency = amt_el
        .attribute("Ccy")
        .ok_or_else(|| Error::CamtParse("entry amount without Ccy".to_string()))?
        .to_string();

    let status = EntryStatus::from_camt(&ntry.require_child_text("Sts")?)?;
    let direction = Direction::from_camt(&ntry.require_child_text("CdtDbtInd")?)?;

    let booking_date_ms = date_millis(ntry.maybe_unique_child("BookgDt")?)?;
    let value_date_ms = date_millis(ntry.maybe_unique_child("ValDt")?)?;

    let entry_ref = match ntry.maybe_child_text("NtryRef")? {
        Some(r) => r,
        None => match ntry.maybe_child_text("AcctSvcrRef")? {
            Some(r) => r,
            None => format!("{}-ntry-{}", message_id, index + 1),
        },
    };

    let bank_transaction_code = parse_bank_tx_code(ntry.maybe_unique_child("BkTxCd")?)?;

    // Collect transaction details across every NtryDtls block, in order.
    let mut details: Vec<&Element> = Vec::new();
    for dtls in ntry
        .child_elements()
        .filter(|el| el.local_name() == "NtryDtls")
    {
        details.extend(
            dtls.child_elements()
                .filter(|el| el.local_name() == "TxDtls"),
        );
    }

    let is_batch = details.len() > 1;
    if let Some(flag) = ntry.maybe_child_text("BtchBookg")? {
        let declared = flag == "true";
        if declared != is_batch {
            // The TxDtls count wins; see the reconciliation design notes.
            warn!(
                entry = %entry_ref,
                declared,
                detail_count = details.len(),
                "BtchBookg disagrees with transaction detail count"
            );
        }
    }

    let mut subject = String::new();
    let mut end_to_end_id = None;
    for detail in &details {
        if let Some(rmt) = detail.maybe_unique_child("RmtInf")? {
            for ustrd in rmt
                .child_elements()
                .filter(|el| el.local_name() == "Ustrd")
            {
                subject.push_str(&ustrd.trimmed_text());
            }
        }
        if end_to_end_id.is_none() {
            if let Some(refs) = detail.maybe_unique_child("Refs")? {
                end_to_end_id = refs.maybe_child_text("EndToEndId")?;
            }
        }
    }

    let mut counterpart_iban = None;
    let mut counterpart_bic = None;
    let mut counterpart_name = None;
    if let Some(first) = details.first() {
        // The counterpart of a credit is the debtor, of a debit the
        // creditor.
        let (party_tag, account_tag, agent_tag) = match direction {
            Direction::Credit => ("Dbtr", "DbtrAcct", "DbtrAgt"),
            Direction::Debit => ("Cdtr", "CdtrAcct", "CdtrAgt"),
        };
        if let Some(parties) = first.maybe_unique_child("RltdPties")? {
            if let Some(party) = parties.maybe_unique_child(party_tag)? {
                counterpart_name = party.maybe_child_text("Nm")?;
            }
            if let Some(account) = parties.maybe_unique_child(account_tag)? {
                if let Some(id) = account.maybe_unique_child("Id")? {
                    counterpart_iban = id.maybe_child_text("IBAN")?;
                }
            }
        }
        if let Some(agents) = first.maybe_unique_child("RltdAgts")? {
            if let Some(agent) = agents.maybe_unique_child(agent_tag)? {
                if let Some(inst) = agent.maybe_unique_child("FinInstnId")? {
                    counterpart_bic = inst.maybe_child_text("BIC")?;
                }
            }
        }
    }

    Ok(NormalizedTransaction {
        account_iban: account_iban.to_string(),
        entry_ref,
        counterpart_iban,
        counterpart_bic,
        counterpart_name,
        amount,
        currency,
        booking_date_ms,
        value_date_ms,
        subject,
        direction,
        status,
        is_batch,
        bank_transaction_code,
        end_to_end_id,
    })
}

fn parse_bank_tx_code(code_el: Option<&Element>) -> Result<BankTransactionCode> {
    let mut code = BankTransactionCode::default();
    let Some(el) = code_el else {
        return Ok(code);
    };
    if let Some(domain) = el.maybe_unique_child("Domn")? {
        let domain_code = domain.require_child_text("Cd")?;
        let family = domain.require_unique_child("Fmly")?;
        code.iso = Some(format!(
            "{}/{}/{}",
            domain_code,
            family.require_child_text("Cd")?,
            family.require_child_text("SubFmlyCd")?
        ));
    }
    if let Some(proprietary) = el.maybe_unique_child("Prtry")? {
        let issuer = proprietary.maybe_child_text("Issr")?.unwrap_or_default();
        code.proprietary = Some(format!(
            "{}:{}",
            issuer,
            proprietary.require_child_text("Cd")?
        ));
    }
    Ok(code)
}

/// camt dates come either as `Dt` (calendar date) or `DtTm` (timestamp).
fn date_millis(date_el: Option<&Element>) -> Result<Option<i64>> {
    let Some(el) = date_el else {
        return Ok(None);
    };
    if let Some(date) = el.maybe_child_text("Dt")? {
        let parsed = chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|e| Error::CamtParse(format!("bad date '{}': {}", date, e)))?;
        let midnight = parsed
            .and_hms_opt(0, 0, 0)
            .expect("midnight exists")
            .and_utc();
        return Ok(Some(midnight.timestamp_millis()));
    }
    if let Some(ts) = el.maybe_child_text("DtTm")? {
        let parsed = chrono::DateTime::parse_from_rfc3339(&ts)
            .map_err(|e| Error::CamtParse(format!("bad timestamp '{}': {}", ts, e)))?;
        return Ok(Some(parsed.timestamp_millis()));
    }
    Ok(None)
}

fn parse_decimal(text: &str) -> Result<Decimal> {
    Decimal::from_str(text).map_err(|e| Error::CamtParse(format!("bad amount '{}': {}", text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn statement_with(entries: &str, balances: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Document xmlns="urn:iso:std:iso:20022:tech:xsd:camt.053.001.02">
  <BkToCstmrStmt>
    <GrpHdr><MsgId>MSG-001</MsgId><CreDtTm>2024-06-01T18:00:00Z</CreDtTm></GrpHdr>
    <Stmt>
      <Id>ST-1</Id>
      <Acct><Id><IBAN>DE75512108001245126199</IBAN></Id></Acct>
      {balances}
      {entries}
    </Stmt>
  </BkToCstmrStmt>
</Document>"#
        )
    }

    fn entry(amount: &str, direction: &str, extra: &str) -> String {
        format!(
            r#"<Ntry>
        <NtryRef>REF-{amount}</NtryRef>
        <Amt Ccy="EUR">{amount}</Amt>
        <CdtDbtInd>{direction}</CdtDbtInd>
        <Sts>BOOK</Sts>
        <BookgDt><Dt>2024-06-01</Dt></BookgDt>
        <ValDt><Dt>2024-06-02</Dt></ValDt>
        {extra}
      </Ntry>"#
        )
    }

    #[test]
    fn two_entries_become_two_booked_credits() {
        let xml = statement_with(
            &format!("{}{}", entry("1.00", "CRDT", ""), entry("5.00", "CRDT", "")),
            "",
        );
        let doc = parse_camt(&xml).unwrap();
        assert_eq!(doc.kind, CamtKind::Statement);
        assert_eq!(doc.message_id, "MSG-001");

        let txs: Vec<_> = doc.transactions().collect();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].amount, dec!(1.00));
        assert_eq!(txs[1].amount, dec!(5.00));
        for tx in txs {
            assert_eq!(tx.currency, "EUR");
            assert_eq!(tx.direction, Direction::Credit);
            assert_eq!(tx.status, EntryStatus::Booked);
            assert!(!tx.is_batch);
            assert_eq!(tx.account_iban, "DE75512108001245126199");
        }
    }

    #[test]
    fn batched_return_concatenates_remittance_lines() {
        let details = r#"<BkTxCd><Domn><Cd>PMNT</Cd><Fmly><Cd>ICDT</Cd><SubFmlyCd>RRTN</SubFmlyCd></Fmly></Domn></BkTxCd>
        <NtryDtls>
          <TxDtls><RmtInf><Ustrd>first part </Ustrd></RmtInf></TxDtls>
          <TxDtls><RmtInf><Ustrd>second part</Ustrd></RmtInf></TxDtls>
        </NtryDtls>"#;
        let xml = statement_with(&entry("42.00", "CRDT", details), "");
        let doc = parse_camt(&xml).unwrap();

        let txs: Vec<_> = doc.transactions().collect();
        assert_eq!(txs.len(), 1);
        let tx = txs[0];
        assert!(tx.is_batch);
        assert_eq!(tx.subject, "first partsecond part");
        assert_eq!(tx.direction, Direction::Credit);
        assert_eq!(
            tx.bank_transaction_code.iso.as_deref(),
            Some("PMNT/ICDT/RRTN")
        );
    }

    #[test]
    fn end_to_end_id_and_counterpart_are_extracted() {
        let details = r#"<NtryDtls><TxDtls>
          <Refs><EndToEndId>E2E-77</EndToEndId></Refs>
          <RltdPties>
            <Cdtr><Nm>Acme GmbH</Nm></Cdtr>
            <CdtrAcct><Id><IBAN>FR1420041010050500013M02606</IBAN></Id></CdtrAcct>
          </RltdPties>
          <RltdAgts><CdtrAgt><FinInstnId><BIC>AGRIFRPP</BIC></FinInstnId></CdtrAgt></RltdAgts>
          <RmtInf><Ustrd>invoice 9</Ustrd></RmtInf>
        </TxDtls></NtryDtls>"#;
        let xml = statement_with(&entry("10.00", "DBIT", details), "");
        let doc = parse_camt(&xml).unwrap();

        let tx = doc.transactions().next().unwrap();
        assert_eq!(tx.end_to_end_id.as_deref(), Some("E2E-77"));
        assert_eq!(tx.counterpart_name.as_deref(), Some("Acme GmbH"));
        assert_eq!(
            tx.counterpart_iban.as_deref(),
            Some("FR1420041010050500013M02606")
        );
        assert_eq!(tx.counterpart_bic.as_deref(), Some("AGRIFRPP"));
        assert_eq!(tx.subject, "invoice 9");
        assert_eq!(tx.signed_amount(), dec!(-10.00));
    }

    #[test]
    fn balance_delta_matches_entry_sum() {
        let balances = r#"
      <Bal><Tp><CdOrPrtry><Cd>OPBD</Cd></CdOrPrtry></Tp><Amt Ccy="EUR">100.00</Amt><CdtDbtInd>CRDT</CdtDbtInd><Dt><Dt>2024-06-01</Dt></Dt></Bal>
      <Bal><Tp><CdOrPrtry><Cd>CLBD</Cd></CdOrPrtry></Tp><Amt Ccy="EUR">96.00</Amt><CdtDbtInd>CRDT</CdtDbtInd><Dt><Dt>2024-06-01</Dt></Dt></Bal>"#;
        let entries = format!("{}{}", entry("1.00", "CRDT", ""), entry("5.00", "DBIT", ""));
        let doc = parse_camt(&statement_with(&entries, balances)).unwrap();

        let stmt = &doc.statements[0];
        let opening = stmt.opening_balance.unwrap();
        let closing = stmt.closing_balance.unwrap();
        let delta: Decimal = stmt.transactions.iter().map(|t| t.signed_amount()).sum();
        assert_eq!(closing - opening, delta);
        assert_eq!(delta, dec!(-4.00));
    }

    #[test]
    fn report_root_is_accepted() {
        let xml = r#"<Document xmlns="urn:iso:std:iso:20022:tech:xsd:camt.052.001.02">
  <BkToCstmrAcctRpt>
    <GrpHdr><MsgId>RPT-1</MsgId></GrpHdr>
    <Rpt><Id>R-1</Id><Acct><Id><IBAN>DE75512108001245126199</IBAN></Id></Acct></Rpt>
  </BkToCstmrAcctRpt>
</Document>"#;
        let doc = parse_camt(xml).unwrap();
        assert_eq!(doc.kind, CamtKind::Report);
        assert_eq!(doc.statements.len(), 1);
    }

    #[test]
    fn wrong_root_fails() {
        assert!(parse_camt("<NotADocument/>").is_err());
        let xml = r#"<Document xmlns="x"><SomethingElse/></Document>"#;
        assert!(parse_camt(xml).is_err());
    }

    #[test]
    fn unknown_status_fails() {
        let bad = r#"<Ntry><NtryRef>R</NtryRef><Amt Ccy="EUR">1.00</Amt><CdtDbtInd>CRDT</CdtDbtInd><Sts>INFO</Sts></Ntry>"#;
        assert!(parse_camt(&statement_with(bad, "")).is_err());
    }

    #[test]
    fn unknown_direction_fails() {
        let bad = r#"<Ntry><NtryRef>R</NtryRef><Amt Ccy="EUR">1.00</Amt><CdtDbtInd>BOTH</CdtDbtInd><Sts>BOOK</Sts></Ntry>"#;
        assert!(parse_camt(&statement_with(bad, "")).is_err());
    }

    #[test]
    fn proprietary_code_without_domain() {
        let extra = r#"<BkTxCd><Prtry><Cd>NTRF</Cd><Issr>DK</Issr></Prtry></BkTxCd>"#;
        let doc = parse_camt(&statement_with(&entry("3.00", "CRDT", extra), "")).unwrap();
        let tx = doc.transactions().next().unwrap();
        assert_eq!(tx.bank_transaction_code.iso, None);
        assert_eq!(tx.bank_transaction_code.proprietary.as_deref(), Some("DK:NTRF"));
    }

    #[test]
    fn missing_entry_reference_gets_a_stable_fallback() {
        let xml = statement_with(
            r#"<Ntry><Amt Ccy="EUR">2.00</Amt><CdtDbtInd>CRDT</CdtDbtInd><Sts>BOOK</Sts></Ntry>"#,
            "",
        );
        let doc = parse_camt(&xml).unwrap();
        assert_eq!(doc.transactions().next().unwrap().entry_ref, "MSG-001-ntry-1");
    }
}
