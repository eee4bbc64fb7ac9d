//! Odoo adapter: JSON-RPC against the ERP for invoices, payments, and
//! customers, plus the read paths behind the accounting audit.
//!
//! `register_payment` and `post_invoice` are monetary mutations tagged
//! no-retry: the executor's retry layer must invoke them at most once per
//! plan, whatever the failure. The dry-run runs the write path against a
//! schema check only; no RPC leaves the process.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::credentials::{blobs, SecretsDir};
use crate::plan::{ActionType, Channel};

use super::{
    require_in_catalog, AdapterError, Capabilities, ChannelAdapter, ExecutionResult, Preview,
};

/// Stored credentials blob (`odoo_credentials.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OdooCredentials {
    /// Base URL of the Odoo instance.
    pub url: String,
    /// Database name.
    pub db: String,
    /// Login user.
    pub username: String,
    /// API key (or password).
    pub api_key: String,
}

/// One invoice line for `create_invoice` / `create_credit_note`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLine {
    /// Line description.
    pub description: String,
    /// Quantity.
    pub quantity: f64,
    /// Unit price.
    pub price_unit: f64,
}

/// Payload for `create_invoice`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInvoicePayload {
    /// Customer name or id the invoice is billed to.
    pub customer: String,
    /// Invoice lines; at least one required.
    pub lines: Vec<InvoiceLine>,
}

impl CreateInvoicePayload {
    /// Parse and schema-check the payload.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Validation`] for shape or field problems.
    pub fn parse(payload: &serde_json::Value) -> Result<Self, AdapterError> {
        let parsed: Self = serde_json::from_value(payload.clone())
            .map_err(|e| AdapterError::Validation(format!("invoice payload: {e}")))?;
        if parsed.customer.trim().is_empty() {
            return Err(AdapterError::Validation("customer is empty".to_owned()));
        }
        if parsed.lines.is_empty() {
            return Err(AdapterError::Validation(
                "invoice needs at least one line".to_owned(),
            ));
        }
        if let Some(bad) = parsed
            .lines
            .iter()
            .find(|l| l.quantity <= 0.0 || l.price_unit < 0.0)
        {
            return Err(AdapterError::Validation(format!(
                "invalid line amounts for {}",
                bad.description
            )));
        }
        Ok(parsed)
    }

    /// Untaxed total across lines.
    pub fn total(&self) -> f64 {
        self.lines
            .iter()
            .map(|l| l.quantity * l.price_unit)
            .sum()
    }
}

/// Payload referencing an existing invoice (`post_invoice`,
/// `create_credit_note`).
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceRefPayload {
    /// Odoo record id of the invoice.
    pub invoice_id: i64,
}

impl InvoiceRefPayload {
    /// Parse and schema-check the payload.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Validation`] for shape or field problems.
    pub fn parse(payload: &serde_json::Value) -> Result<Self, AdapterError> {
        let parsed: Self = serde_json::from_value(payload.clone())
            .map_err(|e| AdapterError::Validation(format!("invoice ref payload: {e}")))?;
        if parsed.invoice_id <= 0 {
            return Err(AdapterError::Validation(format!(
                "invoice_id must be positive, got {}",
                parsed.invoice_id
            )));
        }
        Ok(parsed)
    }
}

/// Payload for `register_payment`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterPaymentPayload {
    /// Odoo record id of the invoice being paid.
    pub invoice_id: i64,
    /// Amount; defaults to the open residual when absent.
    #[serde(default)]
    pub amount: Option<f64>,
}

impl RegisterPaymentPayload {
    /// Parse and schema-check the payload.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Validation`] for shape or field problems.
    pub fn parse(payload: &serde_json::Value) -> Result<Self, AdapterError> {
        let parsed: Self = serde_json::from_value(payload.clone())
            .map_err(|e| AdapterError::Validation(format!("payment payload: {e}")))?;
        if parsed.invoice_id <= 0 {
            return Err(AdapterError::Validation("invoice_id must be positive".to_owned()));
        }
        if let Some(amount) = parsed.amount {
            if amount <= 0.0 {
                return Err(AdapterError::Validation(format!(
                    "payment amount must be positive, got {amount}"
                )));
            }
        }
        Ok(parsed)
    }
}

/// Payload for `create_customer`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCustomerPayload {
    /// Customer display name.
    pub name: String,
    /// Contact email.
    #[serde(default)]
    pub email: Option<String>,
}

impl CreateCustomerPayload {
    /// Parse and schema-check the payload.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Validation`] for shape or field problems.
    pub fn parse(payload: &serde_json::Value) -> Result<Self, AdapterError> {
        let parsed: Self = serde_json::from_value(payload.clone())
            .map_err(|e| AdapterError::Validation(format!("customer payload: {e}")))?;
        if parsed.name.trim().is_empty() {
            return Err(AdapterError::Validation("customer name is empty".to_owned()));
        }
        Ok(parsed)
    }
}

/// Receivable aging bucket boundaries in days overdue.
const AGING_BUCKETS: &[(&str, i64, i64)] = &[
    ("current", i64::MIN, 0),
    ("1-30", 1, 30),
    ("31-60", 31, 60),
    ("61-90", 61, 90),
    ("90+", 91, i64::MAX),
];

/// Bucket open receivables by days overdue.
pub fn aging_buckets(open_items: &[(f64, i64)]) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for (label, lo, hi) in AGING_BUCKETS {
        let total: f64 = open_items
            .iter()
            .filter(|(_, days)| days >= lo && days <= hi)
            .map(|(amount, _)| amount)
            .sum();
        out.insert((*label).to_owned(), serde_json::json!(total));
    }
    serde_json::Value::Object(out)
}

/// Classify a JSON-RPC fault into an adapter error.
pub fn classify_rpc_error(error: &serde_json::Value) -> AdapterError {
    let message = error["message"].as_str().unwrap_or("rpc fault");
    let data_name = error["data"]["name"].as_str().unwrap_or_default();
    let combined = format!("{message} {data_name}");
    let lowered = combined.to_lowercase();
    if lowered.contains("access")
        || lowered.contains("session")
        || lowered.contains("authentication")
    {
        AdapterError::Auth(combined)
    } else {
        AdapterError::Permanent(combined)
    }
}

/// Odoo channel adapter.
#[derive(Debug)]
pub struct OdooAdapter {
    secrets: SecretsDir,
    http: reqwest::Client,
    // Session uid cached for the lifetime of the adapter.
    uid: RwLock<Option<i64>>,
}

impl OdooAdapter {
    /// Create an adapter reading credentials lazily.
    pub fn new(secrets: SecretsDir) -> Self {
        Self {
            secrets,
            http: reqwest::Client::new(),
            uid: RwLock::new(None),
        }
    }

    fn credentials(&self) -> Result<OdooCredentials, AdapterError> {
        Ok(self.secrets.load_json(blobs::ODOO)?)
    }

    async fn rpc(
        &self,
        creds: &OdooCredentials,
        service: &str,
        method: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {"service": service, "method": method, "args": args},
            "id": 1,
        });
        let response = self
            .http
            .post(format!("{}/jsonrpc", creds.url))
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }
        let body: serde_json::Value = response.json().await?;
        if let Some(error) = body.get("error") {
            return Err(classify_rpc_error(error));
        }
        Ok(body["result"].clone())
    }

    async fn authenticated_uid(&self, creds: &OdooCredentials) -> Result<i64, AdapterError> {
        if let Some(uid) = *self.uid.read().await {
            return Ok(uid);
        }
        let result = self
            .rpc(
                creds,
                "common",
                "authenticate",
                serde_json::json!([creds.db, creds.username, creds.api_key, {}]),
            )
            .await?;
        let uid = result
            .as_i64()
            .filter(|uid| *uid > 0)
            .ok_or_else(|| AdapterError::Auth("odoo authentication refused".to_owned()))?;
        *self.uid.write().await = Some(uid);
        debug!(uid, "odoo session authenticated");
        Ok(uid)
    }

    async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: serde_json::Value,
        kwargs: serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        let creds = self.credentials()?;
        let uid = self.authenticated_uid(&creds).await?;
        self.rpc(
            &creds,
            "object",
            "execute_kw",
            serde_json::json!([
                creds.db,
                uid,
                creds.api_key,
                model,
                method,
                args,
                kwargs
            ]),
        )
        .await
    }

    async fn find_partner(&self, customer: &str) -> Result<i64, AdapterError> {
        let found = self
            .execute_kw(
                "res.partner",
                "search",
                serde_json::json!([[["name", "=", customer]]]),
                serde_json::json!({"limit": 1}),
            )
            .await?;
        found
            .as_array()
            .and_then(|ids| ids.first())
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| AdapterError::Permanent(format!("customer not found: {customer}")))
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for OdooAdapter {
    fn channel(&self) -> Channel {
        Channel::Odoo
    }

    async fn capabilities(&self) -> Capabilities {
        match self.credentials() {
            Ok(creds) => Capabilities {
                authenticated: true,
                can_read: true,
                can_write: true,
                granted_scopes: vec!["execute_kw".to_owned()],
                display_identity: format!("{}@{}", creds.username, creds.db),
            },
            Err(_) => Capabilities::unauthenticated(),
        }
    }

    async fn dry_run(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<Preview, AdapterError> {
        require_in_catalog(Channel::Odoo, action)?;
        // Schema check only; nothing leaves the process.
        match action {
            ActionType::CreateInvoice => {
                let invoice = CreateInvoicePayload::parse(payload)?;
                Ok(Preview {
                    summary: format!(
                        "Invoice {} for {:.2} across {} lines",
                        invoice.customer,
                        invoice.total(),
                        invoice.lines.len()
                    ),
                    details: serde_json::json!({
                        "customer": invoice.customer,
                        "total": invoice.total(),
                        "model": "account.move",
                    }),
                })
            }
            ActionType::PostInvoice => {
                let re = InvoiceRefPayload::parse(payload)?;
                Ok(Preview {
                    summary: format!("Post invoice {} (no-retry)", re.invoice_id),
                    details: serde_json::json!({
                        "invoice_id": re.invoice_id,
                        "method": "action_post",
                    }),
                })
            }
            ActionType::RegisterPayment => {
                let payment = RegisterPaymentPayload::parse(payload)?;
                Ok(Preview {
                    summary: format!(
                        "Register payment on invoice {} ({}, no-retry)",
                        payment.invoice_id,
                        payment
                            .amount
                            .map_or("full residual".to_owned(), |a| format!("{a:.2}")),
                    ),
                    details: serde_json::json!({
                        "invoice_id": payment.invoice_id,
                        "amount": payment.amount,
                    }),
                })
            }
            ActionType::CreateCreditNote => {
                let re = InvoiceRefPayload::parse(payload)?;
                Ok(Preview {
                    summary: format!("Credit note reversing invoice {}", re.invoice_id),
                    details: serde_json::json!({"invoice_id": re.invoice_id}),
                })
            }
            ActionType::CreateCustomer => {
                let customer = CreateCustomerPayload::parse(payload)?;
                Ok(Preview {
                    summary: format!("Create customer {}", customer.name),
                    details: serde_json::json!({
                        "name": customer.name,
                        "email": customer.email,
                    }),
                })
            }
            read_only => Ok(Preview {
                summary: format!("Read-only query {read_only}"),
                details: payload.clone(),
            }),
        }
    }

    async fn execute(
        &self,
        action: ActionType,
        payload: &serde_json::Value,
    ) -> Result<ExecutionResult, AdapterError> {
        require_in_catalog(Channel::Odoo, action)?;
        match action {
            ActionType::CreateInvoice => {
                let invoice = CreateInvoicePayload::parse(payload)?;
                let partner_id = self.find_partner(&invoice.customer).await?;
                let lines: Vec<serde_json::Value> = invoice
                    .lines
                    .iter()
                    .map(|l| {
                        serde_json::json!([0, 0, {
                            "name": l.description,
                            "quantity": l.quantity,
                            "price_unit": l.price_unit,
                        }])
                    })
                    .collect();
                let id = self
                    .execute_kw(
                        "account.move",
                        "create",
                        serde_json::json!([{
                            "move_type": "out_invoice",
                            "partner_id": partner_id,
                            "invoice_line_ids": lines,
                        }]),
                        serde_json::json!({}),
                    )
                    .await?;
                Ok(ExecutionResult {
                    object_id: id.as_i64().unwrap_or_default().to_string(),
                    endpoint_used: "account.move/create".to_owned(),
                    details: serde_json::json!({"partner_id": partner_id, "state": "draft"}),
                })
            }
            ActionType::PostInvoice => {
                let re = InvoiceRefPayload::parse(payload)?;
                self.execute_kw(
                    "account.move",
                    "action_post",
                    serde_json::json!([[re.invoice_id]]),
                    serde_json::json!({}),
                )
                .await?;
                Ok(ExecutionResult {
                    object_id: re.invoice_id.to_string(),
                    endpoint_used: "account.move/action_post".to_owned(),
                    details: serde_json::json!({"state": "posted"}),
                })
            }
            ActionType::RegisterPayment => {
                let payment = RegisterPaymentPayload::parse(payload)?;
                let mut record = serde_json::json!({
                    "payment_type": "inbound",
                    "partner_type": "customer",
                });
                if let Some(amount) = payment.amount {
                    record["amount"] = serde_json::json!(amount);
                }
                let wizard_id = self
                    .execute_kw(
                        "account.payment.register",
                        "create",
                        serde_json::json!([record]),
                        serde_json::json!({
                            "context": {
                                "active_model": "account.move",
                                "active_ids": [payment.invoice_id],
                            },
                        }),
                    )
                    .await?;
                self.execute_kw(
                    "account.payment.register",
                    "action_create_payments",
                    serde_json::json!([[wizard_id.as_i64().unwrap_or_default()]]),
                    serde_json::json!({}),
                )
                .await?;
                Ok(ExecutionResult {
                    object_id: payment.invoice_id.to_string(),
                    endpoint_used: "account.payment.register/action_create_payments".to_owned(),
                    details: serde_json::json!({"amount": payment.amount}),
                })
            }
            ActionType::CreateCreditNote => {
                let re = InvoiceRefPayload::parse(payload)?;
                let result = self
                    .execute_kw(
                        "account.move",
                        "action_reverse",
                        serde_json::json!([[re.invoice_id]]),
                        serde_json::json!({}),
                    )
                    .await?;
                Ok(ExecutionResult {
                    object_id: re.invoice_id.to_string(),
                    endpoint_used: "account.move/action_reverse".to_owned(),
                    details: result,
                })
            }
            ActionType::CreateCustomer => {
                let customer = CreateCustomerPayload::parse(payload)?;
                let id = self
                    .execute_kw(
                        "res.partner",
                        "create",
                        serde_json::json!([{
                            "name": customer.name,
                            "email": customer.email,
                            "customer_rank": 1,
                        }]),
                        serde_json::json!({}),
                    )
                    .await?;
                Ok(ExecutionResult {
                    object_id: id.as_i64().unwrap_or_default().to_string(),
                    endpoint_used: "res.partner/create".to_owned(),
                    details: serde_json::json!({}),
                })
            }
            read_only => Err(AdapterError::Validation(format!(
                "{read_only} is a read path; use list()"
            ))),
        }
    }

    async fn list(&self, query: &serde_json::Value) -> Result<serde_json::Value, AdapterError> {
        let action = query["action"].as_str().unwrap_or("list_invoices");
        let limit = query["limit"].as_u64().unwrap_or(50);
        match action {
            "list_invoices" => {
                let mut domain = vec![serde_json::json!(["move_type", "=", "out_invoice"])];
                if query["unpaid_only"].as_bool().unwrap_or(false) {
                    domain.push(serde_json::json!(["payment_state", "in", ["not_paid", "partial"]]));
                    domain.push(serde_json::json!(["state", "=", "posted"]));
                }
                self.execute_kw(
                    "account.move",
                    "search_read",
                    serde_json::json!([domain]),
                    serde_json::json!({
                        "fields": ["name", "partner_id", "amount_total", "amount_residual",
                                   "invoice_date_due", "payment_state", "state"],
                        "limit": limit,
                    }),
                )
                .await
            }
            "list_customers" => {
                self.execute_kw(
                    "res.partner",
                    "search_read",
                    serde_json::json!([[["customer_rank", ">", 0]]]),
                    serde_json::json!({"fields": ["name", "email"], "limit": limit}),
                )
                .await
            }
            "revenue_summary" => {
                let since = query["since"].as_str().unwrap_or("1970-01-01");
                self.execute_kw(
                    "account.move",
                    "read_group",
                    serde_json::json!([
                        [["move_type", "=", "out_invoice"], ["state", "=", "posted"],
                         ["invoice_date", ">=", since]],
                        ["amount_total"],
                        ["invoice_date:month"]
                    ]),
                    serde_json::json!({}),
                )
                .await
            }
            "ar_aging" => {
                let rows = self
                    .execute_kw(
                        "account.move",
                        "search_read",
                        serde_json::json!([[
                            ["move_type", "=", "out_invoice"],
                            ["state", "=", "posted"],
                            ["payment_state", "in", ["not_paid", "partial"]]
                        ]]),
                        serde_json::json!({
                            "fields": ["amount_residual", "invoice_date_due"],
                            "limit": 1000,
                        }),
                    )
                    .await?;
                let today = chrono::Utc::now().date_naive();
                let open_items: Vec<(f64, i64)> = rows
                    .as_array()
                    .map(|rows| {
                        rows.iter()
                            .map(|row| {
                                let amount = row["amount_residual"].as_f64().unwrap_or(0.0);
                                let days = row["invoice_date_due"]
                                    .as_str()
                                    .and_then(|d| {
                                        chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()
                                    })
                                    .map(|due| today.signed_duration_since(due).num_days())
                                    .unwrap_or(0);
                                (amount, days)
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(aging_buckets(&open_items))
            }
            other => Err(AdapterError::Validation(format!(
                "unknown odoo query action: {other}"
            ))),
        }
    }

    async fn read(&self, id: &str) -> Result<serde_json::Value, AdapterError> {
        let record_id: i64 = id
            .parse()
            .map_err(|_| AdapterError::Validation(format!("invoice id is not numeric: {id}")))?;
        self.execute_kw(
            "account.move",
            "read",
            serde_json::json!([[record_id]]),
            serde_json::json!({
                "fields": ["name", "partner_id", "amount_total", "amount_residual",
                           "payment_state", "state"],
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_payload_validation() {
        let ok = CreateInvoicePayload::parse(&serde_json::json!({
            "customer": "Acme GmbH",
            "lines": [{"description": "Consulting", "quantity": 2.0, "price_unit": 450.0}],
        }))
        .expect("valid");
        assert!((ok.total() - 900.0).abs() < f64::EPSILON);

        assert!(CreateInvoicePayload::parse(&serde_json::json!({
            "customer": "Acme", "lines": [],
        }))
        .is_err());
        assert!(CreateInvoicePayload::parse(&serde_json::json!({
            "customer": "Acme",
            "lines": [{"description": "x", "quantity": 0.0, "price_unit": 1.0}],
        }))
        .is_err());
    }

    #[test]
    fn test_payment_payload_validation() {
        assert!(RegisterPaymentPayload::parse(&serde_json::json!({"invoice_id": 42})).is_ok());
        assert!(
            RegisterPaymentPayload::parse(&serde_json::json!({"invoice_id": 42, "amount": 10.0}))
                .is_ok()
        );
        assert!(
            RegisterPaymentPayload::parse(&serde_json::json!({"invoice_id": -1})).is_err()
        );
        assert!(RegisterPaymentPayload::parse(
            &serde_json::json!({"invoice_id": 42, "amount": 0.0})
        )
        .is_err());
    }

    #[test]
    fn test_aging_buckets() {
        let items = vec![
            (100.0, -5),  // not yet due
            (200.0, 10),  // 1-30
            (300.0, 45),  // 31-60
            (400.0, 75),  // 61-90
            (500.0, 120), // 90+
        ];
        let buckets = aging_buckets(&items);
        assert_eq!(buckets["current"], 100.0);
        assert_eq!(buckets["1-30"], 200.0);
        assert_eq!(buckets["31-60"], 300.0);
        assert_eq!(buckets["61-90"], 400.0);
        assert_eq!(buckets["90+"], 500.0);
    }

    #[test]
    fn test_rpc_error_classification() {
        let auth = classify_rpc_error(&serde_json::json!({
            "message": "Odoo Server Error",
            "data": {"name": "odoo.exceptions.AccessDenied"},
        }));
        assert!(auth.is_auth());

        let permanent = classify_rpc_error(&serde_json::json!({
            "message": "Record does not exist",
            "data": {"name": "odoo.exceptions.MissingError"},
        }));
        assert!(matches!(permanent, AdapterError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_dry_run_is_local_schema_check() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = OdooAdapter::new(SecretsDir::new(dir.path()));
        // No credentials exist; a dry-run still validates because nothing
        // leaves the process.
        let preview = adapter
            .dry_run(
                ActionType::RegisterPayment,
                &serde_json::json!({"invoice_id": 42}),
            )
            .await
            .expect("schema check only");
        assert!(preview.summary.contains("no-retry"));
    }

    #[tokio::test]
    async fn test_read_path_rejected_by_execute() {
        let dir = tempfile::tempdir().expect("tempdir");
        let adapter = OdooAdapter::new(SecretsDir::new(dir.path()));
        let result = adapter
            .execute(ActionType::ListInvoices, &serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(AdapterError::Validation(_))));
    }
}
