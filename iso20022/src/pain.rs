//! pain.001.001.03 credit-transfer initiation
//!
//! Emits exactly one `PmtInf` with exactly one `CdtTrfTxInf` per message.
//! The parser recovers the same record, used for round-trip verification
//! and by the sandbox host to validate uploads.

use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use moneta_xml::Element;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::str::FromStr;

const PAIN_NS: &str = "urn:iso:std:iso:20022:tech:xsd:pain.001.001.03";

/// Placeholder the scheme prescribes when the initiator supplies no
/// end-to-end reference.
pub const END_TO_END_NOT_PROVIDED: &str = "NOTPROVIDED";

/// One credit-transfer initiation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInitiation {
    pub message_id: String,
    pub payment_information_id: String,
    pub end_to_end_id: Option<String>,
    pub creation_timestamp: DateTime<Utc>,
    pub execution_date: NaiveDate,
    pub debtor_name: String,
    pub debtor_iban: String,
    pub debtor_bic: String,
    pub creditor_name: String,
    pub creditor_iban: String,
    pub creditor_bic: String,
    pub amount: Decimal,
    pub currency: String,
    pub subject: String,
}

impl PaymentInitiation {
    /// The reference the bank will echo in statements.
    pub fn effective_end_to_end_id(&self) -> &str {
        self.end_to_end_id
            .as_deref()
            .unwrap_or(END_TO_END_NOT_PROVIDED)
    }
}

/// Shape checks on caller-supplied payment data.
pub fn validate(payment: &PaymentInitiation) -> Result<()> {
    let bic = regex::Regex::new(r"^[A-Z]{6}[A-Z0-9]{2}([A-Z0-9]{3})?$")
        .expect("static BIC pattern");
    let iban = regex::Regex::new(r"^[A-Z]{2}[0-9]{2}[A-Z0-9]{10,30}$")
        .expect("static IBAN pattern");

    for (label, value) in [
        ("debtor BIC", &payment.debtor_bic),
        ("creditor BIC", &payment.creditor_bic),
    ] {
        if !bic.is_match(value) {
            return Err(Error::Validation(format!("invalid {}: {}", label, value)));
        }
    }
    for (label, value) in [
        ("debtor IBAN", &payment.debtor_iban),
        ("creditor IBAN", &payment.creditor_iban),
    ] {
        if !iban.is_match(value) {
            return Err(Error::Validation(format!("invalid {}: {}", label, value)));
        }
    }
    if payment.amount <= Decimal::ZERO {
        return Err(Error::Validation(format!(
            "amount must be positive, got {}",
            payment.amount
        )));
    }
    if payment.currency.len() != 3 || !payment.currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(Error::Validation(format!(
            "invalid currency code: {}",
            payment.currency
        )));
    }
    Ok(())
}

/// Serialize to a pain.001.001.03 document.
pub fn emit_pain001(payment: &PaymentInitiation) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let amount = payment.amount.to_string();
    let creation = payment
        .creation_timestamp
        .to_rfc3339_opts(SecondsFormat::Secs, true);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| Error::PainParse(e.to_string()))?;

    let mut root = BytesStart::new("Document");
    root.push_attribute(("xmlns", PAIN_NS));
    write_start(&mut writer, root)?;
    write_start(&mut writer, BytesStart::new("CstmrCdtTrfInitn"))?;

    // Group header
    write_start(&mut writer, BytesStart::new("GrpHdr"))?;
    write_element(&mut writer, "MsgId", &payment.message_id)?;
    write_element(&mut writer, "CreDtTm", &creation)?;
    write_element(&mut writer, "NbOfTxs", "1")?;
    write_element(&mut writer, "CtrlSum", &amount)?;
    write_start(&mut writer, BytesStart::new("InitgPty"))?;
    write_element(&mut writer, "Nm", &payment.debtor_name)?;
    write_end(&mut writer, "InitgPty")?;
    write_end(&mut writer, "GrpHdr")?;

    // Payment information, exactly one
    write_start(&mut writer, BytesStart::new("PmtInf"))?;
    write_element(&mut writer, "PmtInfId", &payment.payment_information_id)?;
    write_element(&mut writer, "PmtMtd", "TRF")?;
    write_element(&mut writer, "BtchBookg", "true")?;
    write_element(&mut writer, "NbOfTxs", "1")?;
    write_element(&mut writer, "CtrlSum", &amount)?;
    write_start(&mut writer, BytesStart::new("PmtTpInf"))?;
    write_start(&mut writer, BytesStart::new("SvcLvl"))?;
    write_element(&mut writer, "Cd", "SEPA")?;
    write_end(&mut writer, "SvcLvl")?;
    write_end(&mut writer, "PmtTpInf")?;
    write_element(
        &mut writer,
        "ReqdExctnDt",
        &payment.execution_date.format("%Y-%m-%d").to_string(),
    )?;
    write_start(&mut writer, BytesStart::new("Dbtr"))?;
    write_element(&mut writer, "Nm", &payment.debtor_name)?;
    write_end(&mut writer, "Dbtr")?;
    write_start(&mut writer, BytesStart::new("DbtrAcct"))?;
    write_start(&mut writer, BytesStart::new("Id"))?;
    write_element(&mut writer, "IBAN", &payment.debtor_iban)?;
    write_end(&mut writer, "Id")?;
    write_end(&mut writer, "DbtrAcct")?;
    write_start(&mut writer, BytesStart::new("DbtrAgt"))?;
    write_start(&mut writer, BytesStart::new("FinInstnId"))?;
    write_element(&mut writer, "BIC", &payment.debtor_bic)?;
    write_end(&mut writer, "FinInstnId")?;
    write_end(&mut writer, "DbtrAgt")?;
    write_element(&mut writer, "ChrgBr", "SLEV")?;

    // Credit transfer transaction, exactly one
    write_start(&mut writer, BytesStart::new("CdtTrfTxInf"))?;
    write_start(&mut writer, BytesStart::new("PmtId"))?;
    write_element(&mut writer, "EndToEndId", payment.effective_end_to_end_id())?;
    write_end(&mut writer, "PmtId")?;
    write_start(&mut writer, BytesStart::new("Amt"))?;
    let mut instd = BytesStart::new("InstdAmt");
    instd.push_attribute(("Ccy", payment.currency.as_str()));
    writer
        .write_event(Event::Start(instd))
        .map_err(|e| Error::PainParse(e.to_string()))?;
    writer
        .write_event(Event::Text(BytesText::new(&amount)))
        .map_err(|e| Error::PainParse(e.to_string()))?;
    write_end(&mut writer, "InstdAmt")?;
    write_end(&mut writer, "Amt")?;
    write_start(&mut writer, BytesStart::new("CdtrAgt"))?;
    write_start(&mut writer, BytesStart::new("FinInstnId"))?;
    write_element(&mut writer, "BIC", &payment.creditor_bic)?;
    write_end(&mut writer, "FinInstnId")?;
    write_end(&mut writer, "CdtrAgt")?;
    write_start(&mut writer, BytesStart::new("Cdtr"))?;
    write_element(&mut writer, "Nm", &payment.creditor_name)?;
    write_end(&mut writer, "Cdtr")?;
    write_start(&mut writer, BytesStart::new("CdtrAcct"))?;
    write_start(&mut writer, BytesStart::new("Id"))?;
    write_element(&mut writer, "IBAN", &payment.creditor_iban)?;
    write_end(&mut writer, "Id")?;
    write_end(&mut writer, "CdtrAcct")?;
    write_start(&mut writer, BytesStart::new("RmtInf"))?;
    write_element(&mut writer, "Ustrd", &payment.subject)?;
    write_end(&mut writer, "RmtInf")?;
    write_end(&mut writer, "CdtTrfTxInf")?;

    write_end(&mut writer, "PmtInf")?;
    write_end(&mut writer, "CstmrCdtTrfInitn")?;
    write_end(&mut writer, "Document")?;

    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(|e| Error::PainParse(e.to_string()))
}

fn write_start(writer: &mut Writer<Cursor<Vec<u8>>>, start: BytesStart) -> Result<()> {
    writer
        .write_event(Event::Start(start))
        .map_err(|e| Error::PainParse(e.to_string()))
}

fn write_end(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str) -> Result<()> {
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(|e| Error::PainParse(e.to_string()))
}

fn write_element(writer: &mut Writer<Cursor<Vec<u8>>>, tag: &str, text: &str) -> Result<()> {
    write_start(writer, BytesStart::new(tag))?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(|e| Error::PainParse(e.to_string()))?;
    write_end(writer, tag)
}

/// Parse a pain.001.001.03 document back into the initiation record.
pub fn parse_pain001(xml: &str) -> Result<PaymentInitiation> {
    let doc = Element::parse(xml)?;
    if doc.local_name() != "Document" {
        return Err(Error::PainParse(format!(
            "expected pain root 'Document', found '{}'",
            doc.local_name()
        )));
    }
    let initiation = doc.require_unique_child("CstmrCdtTrfInitn")?;
    let group_header = initiation.require_unique_child("GrpHdr")?;
    let message_id = group_header.require_child_text("MsgId")?;
    let creation_timestamp =
        DateTime::parse_from_rfc3339(&group_header.require_child_text("CreDtTm")?)
            .map_err(|e| Error::PainParse(format!("bad CreDtTm: {}", e)))?
            .with_timezone(&Utc);

    let pmt_inf = initiation.require_unique_child("PmtInf")?;
    let payment_information_id = pmt_inf.require_child_text("PmtInfId")?;
    let execution_date =
        NaiveDate::parse_from_str(&pmt_inf.require_child_text("ReqdExctnDt")?, "%Y-%m-%d")
            .map_err(|e| Error::PainParse(format!("bad ReqdExctnDt: {}", e)))?;
    let debtor_name = pmt_inf
        .require_unique_child("Dbtr")?
        .require_child_text("Nm")?;
    let debtor_iban = pmt_inf
        .require_unique_child("DbtrAcct")?
        .require_unique_child("Id")?
        .require_child_text("IBAN")?;
    let debtor_bic = pmt_inf
        .require_unique_child("DbtrAgt")?
        .require_unique_child("FinInstnId")?
        .require_child_text("BIC")?;

    let tx = pmt_inf.require_unique_child("CdtTrfTxInf")?;
    let end_to_end_text = tx
        .require_unique_child("PmtId")?
        .require_child_text("EndToEndId")?;
    let end_to_end_id = if end_to_end_text == END_TO_END_NOT_PROVIDED {
        None
    } else {
        Some(end_to_end_text)
    };
    let instd = tx
        .require_unique_child("Amt")?
        .require_unique_child("InstdAmt")?;
    let amount = Decimal::from_str(&instd.trimmed_text())
        .map_err(|e| Error::PainParse(format!("bad InstdAmt: {}", e)))?;
    let currency = instd
        .attribute("Ccy")
        .ok_or_else(|| Error::PainParse("InstdAmt without Ccy".to_string()))?
        .to_string();
    let creditor_bic = tx
        .require_unique_child("CdtrAgt")?
        .require_unique_child("FinInstnId")?
        .require_child_text("BIC")?;
    let creditor_name = tx
        .require_unique_child("Cdtr")?
        .require_child_text("Nm")?;
    let creditor_iban = tx
        .require_unique_child("CdtrAcct")?
        .require_unique_child("Id")?
        .require_child_text("IBAN")?;
    let subject = match tx.maybe_unique_child("RmtInf")? {
        Some(rmt) => rmt.maybe_child_text("Ustrd")?.unwrap_or_default(),
        None => String::new(),
    };

    Ok(PaymentInitiation {
        message_id,
        payment_information_id,
        end_to_end_id,
        creation_timestamp,
        execution_date,
        debtor_name,
        debtor_iban,
        debtor_bic,
        creditor_name,
        creditor_iban,
        creditor_bic,
        amount,
        currency,
        subject,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sample() -> PaymentInitiation {
        PaymentInitiation {
            message_id: "MSG-42".to_string(),
            payment_information_id: "PMT-42".to_string(),
            end_to_end_id: Some("E2E-42".to_string()),
            creation_timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 9, 30, 0).unwrap(),
            execution_date: NaiveDate::from_ymd_opt(2024, 6, 2).unwrap(),
            debtor_name: "Oliver Smith".to_string(),
            debtor_iban: "GB33BUKB20201555555555".to_string(),
            debtor_bic: "BUKBGB22".to_string(),
            creditor_name: "Jane Doe".to_string(),
            creditor_iban: "DE75512108001245126199".to_string(),
            creditor_bic: "SOGEDEFF".to_string(),
            amount: dec!(250.75),
            currency: "EUR".to_string(),
            subject: "rent June".to_string(),
        }
    }

    #[test]
    fn emit_then_parse_recovers_the_record() {
        let payment = sample();
        let xml = emit_pain001(&payment).unwrap();
        let recovered = parse_pain001(&xml).unwrap();
        assert_eq!(recovered, payment);
    }

    #[test]
    fn emitted_document_carries_the_required_fields() {
        let xml = emit_pain001(&sample()).unwrap();
        assert!(xml.contains("<MsgId>MSG-42</MsgId>"));
        assert!(xml.contains("<CreDtTm>2024-06-01T09:30:00Z</CreDtTm>"));
        assert!(xml.contains("<NbOfTxs>1</NbOfTxs>"));
        assert!(xml.contains("<CtrlSum>250.75</CtrlSum>"));
        assert!(xml.contains("<PmtMtd>TRF</PmtMtd>"));
        assert!(xml.contains("<BtchBookg>true</BtchBookg>"));
        assert!(xml.contains("<ChrgBr>SLEV</ChrgBr>"));
        assert!(xml.contains("<InstdAmt Ccy=\"EUR\">250.75</InstdAmt>"));
        assert!(xml.contains("<Ustrd>rent June</Ustrd>"));
        assert!(xml.contains("<EndToEndId>E2E-42</EndToEndId>"));
    }

    #[test]
    fn missing_end_to_end_id_becomes_notprovided() {
        let mut payment = sample();
        payment.end_to_end_id = None;
        let xml = emit_pain001(&payment).unwrap();
        assert!(xml.contains("<EndToEndId>NOTPROVIDED</EndToEndId>"));

        let recovered = parse_pain001(&xml).unwrap();
        assert_eq!(recovered.end_to_end_id, None);
    }

    #[test]
    fn validation_rejects_bad_bic() {
        let mut payment = sample();
        payment.creditor_bic = "not-a-BIC".to_string();
        assert!(matches!(validate(&payment), Err(Error::Validation(_))));
    }

    #[test]
    fn validation_rejects_bad_iban_and_amount() {
        let mut payment = sample();
        payment.creditor_iban = "12345".to_string();
        assert!(validate(&payment).is_err());

        let mut payment = sample();
        payment.amount = dec!(0);
        assert!(validate(&payment).is_err());

        let mut payment = sample();
        payment.currency = "euro".to_string();
        assert!(validate(&payment).is_err());
    }

    #[test]
    fn validation_accepts_the_sample() {
        assert!(validate(&sample()).is_ok());
    }

    #[test]
    fn amounts_serialize_with_decimal_point() {
        let mut payment = sample();
        payment.amount = dec!(1234567.89);
        let xml = emit_pain001(&payment).unwrap();
        assert!(xml.contains(">1234567.89<"));
    }
}
