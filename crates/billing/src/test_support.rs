//! In-memory billing store and scripted gateway
//!
//! Both doubles yield to the scheduler on every call so that runs joined on
//! one task interleave the way two worker processes would against Postgres.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeReceipt, ChargeRequest, GatewayError, PaymentGateway};
use crate::models::{
    AttemptStatus, DueInvoice, Invoice, InvoiceStatus, NewInvoice, PaymentAttempt, PaymentMethod,
    PaymentMethodStatus, Student, StudentSubscription, SubscriptionStatus, TuitionPlan,
};
use crate::store::{
    BillingStore, ChargeClaim, ChargeFailure, ChargeSuccess, NewAttempt, SettledSuccess,
};

#[derive(Default)]
struct MemoryState {
    plans: HashMap<Uuid, TuitionPlan>,
    subscriptions: HashMap<Uuid, StudentSubscription>,
    invoices: HashMap<Uuid, Invoice>,
    attempts: Vec<PaymentAttempt>,
    methods: Vec<PaymentMethod>,
    students: HashMap<Uuid, Student>,
    fail_next_settlement: bool,
}

#[derive(Default)]
pub struct MemoryBillingStore {
    state: Mutex<MemoryState>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_plan(&self, plan: TuitionPlan) {
        self.state().plans.insert(plan.id, plan);
    }

    pub fn insert_subscription(&self, subscription: StudentSubscription) {
        self.state()
            .subscriptions
            .insert(subscription.id, subscription);
    }

    pub fn insert_invoice(&self, invoice: Invoice) {
        self.state().invoices.insert(invoice.id, invoice);
    }

    pub fn insert_attempt(&self, attempt: PaymentAttempt) {
        self.state().attempts.push(attempt);
    }

    pub fn insert_payment_method(&self, method: PaymentMethod) {
        self.state().methods.push(method);
    }

    pub fn insert_student(&self, student: Student) {
        self.state().students.insert(student.id, student);
    }

    /// Make the next `settle_success`/`settle_failure` fail without writing
    pub fn fail_next_settlement(&self) {
        self.state().fail_next_settlement = true;
    }

    pub fn set_subscription_status(&self, subscription_id: Uuid, status: SubscriptionStatus) {
        if let Some(sub) = self.state().subscriptions.get_mut(&subscription_id) {
            sub.status = status;
        }
    }

    pub fn invoice(&self, id: Uuid) -> Option<Invoice> {
        self.state().invoices.get(&id).cloned()
    }

    pub fn invoices(&self) -> Vec<Invoice> {
        let mut invoices: Vec<Invoice> = self.state().invoices.values().cloned().collect();
        invoices.sort_by_key(|i| (i.due_date, i.created_at));
        invoices
    }

    pub fn invoices_for_subscription(&self, subscription_id: Uuid) -> Vec<Invoice> {
        self.invoices()
            .into_iter()
            .filter(|i| i.subscription_id == Some(subscription_id))
            .collect()
    }

    pub fn subscription(&self, id: Uuid) -> Option<StudentSubscription> {
        self.state().subscriptions.get(&id).cloned()
    }

    pub fn attempts_for(&self, invoice_id: Uuid) -> Vec<PaymentAttempt> {
        let mut attempts: Vec<PaymentAttempt> = self
            .state()
            .attempts
            .iter()
            .filter(|a| a.invoice_id == invoice_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.attempt_no);
        attempts
    }

    fn take_settlement_failure(state: &mut MemoryState) -> BillingResult<()> {
        if std::mem::take(&mut state.fail_next_settlement) {
            return Err(BillingError::Storage(
                "connection reset during settlement".to_string(),
            ));
        }
        Ok(())
    }

    fn charging_invoice<'a>(
        state: &'a mut MemoryState,
        invoice_id: Uuid,
    ) -> BillingResult<&'a mut Invoice> {
        match state.invoices.get_mut(&invoice_id) {
            Some(invoice) if invoice.status == InvoiceStatus::Charging => Ok(invoice),
            Some(_) => Err(BillingError::ConcurrentModification(format!(
                "Invoice {} is not CHARGING",
                invoice_id
            ))),
            None => Err(BillingError::NotFound(format!("Invoice {}", invoice_id))),
        }
    }

    fn complete_attempt(
        state: &mut MemoryState,
        attempt_id: Uuid,
        apply: impl FnOnce(&mut PaymentAttempt),
    ) -> BillingResult<()> {
        let attempt = state
            .attempts
            .iter_mut()
            .find(|a| a.id == attempt_id)
            .ok_or_else(|| BillingError::NotFound(format!("Payment attempt {}", attempt_id)))?;
        apply(attempt);
        Ok(())
    }
}

fn is_claimable(invoice: &Invoice, today: Date) -> bool {
    invoice.status == InvoiceStatus::Pending
        && invoice.due_date <= today
        && invoice.last_attempted_on.map_or(true, |day| day < today)
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn due_invoices(&self, today: Date) -> BillingResult<Vec<DueInvoice>> {
        tokio::task::yield_now().await;
        let state = self.state();

        let mut due: Vec<DueInvoice> = state
            .invoices
            .values()
            .filter(|i| is_claimable(i, today))
            .map(|invoice| {
                let mut attempts: Vec<PaymentAttempt> = state
                    .attempts
                    .iter()
                    .filter(|a| a.invoice_id == invoice.id)
                    .cloned()
                    .collect();
                attempts.sort_by_key(|a| a.attempt_no);
                DueInvoice {
                    plan: invoice.plan_id.and_then(|id| state.plans.get(&id).cloned()),
                    subscription: invoice
                        .subscription_id
                        .and_then(|id| state.subscriptions.get(&id).cloned()),
                    attempts,
                    invoice: invoice.clone(),
                }
            })
            .collect();
        due.sort_by_key(|d| (d.invoice.due_date, d.invoice.created_at));
        Ok(due)
    }

    async fn students_by_ids(&self, ids: &[Uuid]) -> BillingResult<HashMap<Uuid, Student>> {
        tokio::task::yield_now().await;
        let state = self.state();
        Ok(ids
            .iter()
            .filter_map(|id| state.students.get(id).map(|s| (*id, s.clone())))
            .collect())
    }

    async fn current_payment_method(
        &self,
        student_id: Uuid,
    ) -> BillingResult<Option<PaymentMethod>> {
        tokio::task::yield_now().await;
        Ok(self
            .state()
            .methods
            .iter()
            .filter(|m| m.student_id == student_id && m.status == PaymentMethodStatus::Active)
            .max_by_key(|m| m.created_at)
            .cloned())
    }

    async fn fail_exhausted_invoice(&self, invoice_id: Uuid) -> BillingResult<bool> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        match state.invoices.get_mut(&invoice_id) {
            Some(invoice) if invoice.status == InvoiceStatus::Pending => {
                invoice.status = InvoiceStatus::Failed;
                invoice.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_invoice(
        &self,
        invoice_id: Uuid,
        today: Date,
        now: OffsetDateTime,
    ) -> BillingResult<Option<ChargeClaim>> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        let attempts_made = state
            .attempts
            .iter()
            .filter(|a| a.invoice_id == invoice_id)
            .count() as u32;

        match state.invoices.get_mut(&invoice_id) {
            Some(invoice) if is_claimable(invoice, today) => {
                invoice.status = InvoiceStatus::Charging;
                invoice.charging_started_at = Some(now);
                invoice.last_attempted_on = Some(today);
                invoice.updated_at = now;
                Ok(Some(ChargeClaim { attempts_made }))
            }
            _ => Ok(None),
        }
    }

    async fn release_claim(&self, invoice_id: Uuid) -> BillingResult<()> {
        tokio::task::yield_now().await;
        if let Some(invoice) = self.state().invoices.get_mut(&invoice_id) {
            if invoice.status == InvoiceStatus::Charging {
                invoice.status = InvoiceStatus::Pending;
                invoice.charging_started_at = None;
            }
        }
        Ok(())
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> BillingResult<PaymentAttempt> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if state
            .attempts
            .iter()
            .any(|a| a.invoice_id == attempt.invoice_id && a.attempt_no == attempt.attempt_no)
        {
            return Err(BillingError::ConcurrentModification(format!(
                "Attempt {} of invoice {} already exists",
                attempt.attempt_no, attempt.invoice_id
            )));
        }

        let record = PaymentAttempt {
            id: Uuid::new_v4(),
            invoice_id: attempt.invoice_id,
            attempt_no: attempt.attempt_no,
            status: AttemptStatus::Requested,
            provider_transaction_id: None,
            error_code: None,
            error_message: None,
            requested_at: attempt.requested_at,
            completed_at: None,
        };
        state.attempts.push(record.clone());
        Ok(record)
    }

    async fn settle_success(&self, success: &ChargeSuccess) -> BillingResult<SettledSuccess> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        Self::take_settlement_failure(&mut state)?;
        Self::charging_invoice(&mut state, success.invoice_id)?;

        Self::complete_attempt(&mut state, success.attempt_id, |attempt| {
            attempt.status = AttemptStatus::Success;
            attempt.provider_transaction_id = Some(success.payment_key.clone());
            attempt.completed_at = Some(success.paid_at);
        })?;

        let invoice = Self::charging_invoice(&mut state, success.invoice_id)?;
        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(success.paid_at);
        invoice.provider_payment_key = Some(success.payment_key.clone());
        invoice.charging_started_at = None;
        invoice.updated_at = success.paid_at;

        let Some(roll) = &success.roll_forward else {
            return Ok(SettledSuccess::Paid);
        };

        let advanced = match state.subscriptions.get_mut(&roll.subscription_id) {
            Some(sub) if sub.status != SubscriptionStatus::Canceled => {
                sub.next_billing_date = roll.next_billing_date;
                sub.updated_at = success.paid_at;
                true
            }
            _ => false,
        };
        if !advanced {
            return Ok(SettledSuccess::Paid);
        }

        let next = pending_invoice(&roll.next_invoice, success.paid_at);
        state.invoices.insert(next.id, next);
        Ok(SettledSuccess::RolledForward {
            next_invoice_id: roll.next_invoice.id,
        })
    }

    async fn settle_failure(&self, failure: &ChargeFailure) -> BillingResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        Self::take_settlement_failure(&mut state)?;
        Self::charging_invoice(&mut state, failure.invoice_id)?;

        Self::complete_attempt(&mut state, failure.attempt_id, |attempt| {
            attempt.status = AttemptStatus::Failed;
            attempt.error_code = Some(failure.error_code.clone());
            attempt.error_message = Some(failure.error_message.clone());
            attempt.completed_at = Some(failure.completed_at);
        })?;

        let invoice = Self::charging_invoice(&mut state, failure.invoice_id)?;
        invoice.status = if failure.terminal {
            InvoiceStatus::Failed
        } else {
            InvoiceStatus::Pending
        };
        invoice.charging_started_at = None;
        invoice.updated_at = failure.completed_at;
        Ok(())
    }
}

/// Materialize a `NewInvoice` as a stored PENDING invoice
pub fn pending_invoice(new: &NewInvoice, created_at: OffsetDateTime) -> Invoice {
    Invoice {
        id: new.id,
        academy_id: new.academy_id,
        student_id: new.student_id,
        subscription_id: new.subscription_id,
        plan_id: new.plan_id,
        amount: new.amount,
        currency: new.currency.clone(),
        due_date: new.due_date,
        status: InvoiceStatus::Pending,
        order_id: new.order_id.clone(),
        paid_at: None,
        provider_payment_key: None,
        charging_started_at: None,
        last_attempted_on: None,
        created_at,
        updated_at: created_at,
    }
}

/// Everything a billed subscription needs, seeded into a store
#[derive(Debug, Clone)]
pub struct SeededSubscription {
    pub student: Student,
    pub plan: TuitionPlan,
    pub subscription: StudentSubscription,
    pub invoice: Invoice,
    pub payment_method: Option<PaymentMethod>,
}

/// Builder for one student on one plan with a PENDING invoice
pub struct SubscriptionSeed {
    amount: i64,
    billing_day: i16,
    due_date: Date,
    with_payment_method: bool,
    status: SubscriptionStatus,
}

impl SubscriptionSeed {
    pub fn new(amount: i64, billing_day: i16, due_date: Date) -> Self {
        Self {
            amount,
            billing_day,
            due_date,
            with_payment_method: true,
            status: SubscriptionStatus::Active,
        }
    }

    pub fn without_payment_method(mut self) -> Self {
        self.with_payment_method = false;
        self
    }

    pub fn status(mut self, status: SubscriptionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn seed(self, store: &MemoryBillingStore) -> SeededSubscription {
        let now = OffsetDateTime::now_utc();
        let academy_id = Uuid::new_v4();

        let student = Student {
            id: Uuid::new_v4(),
            academy_id,
            name: "Kim Minji".to_string(),
            email: Some("parent@example.com".to_string()),
        };
        let plan = TuitionPlan {
            id: Uuid::new_v4(),
            academy_id,
            name: "Math Basic".to_string(),
            amount: self.amount,
            currency: "KRW".to_string(),
            billing_day: self.billing_day,
            grace_days: 0,
            late_fee: None,
            active: true,
            created_at: now,
            updated_at: now,
        };
        let subscription = StudentSubscription {
            id: Uuid::new_v4(),
            academy_id,
            student_id: student.id,
            plan_id: plan.id,
            status: self.status,
            next_billing_date: self.due_date,
            created_at: now,
            updated_at: now,
        };
        let invoice = pending_invoice(
            &NewInvoice::next_period(&subscription, &plan, self.due_date),
            now,
        );
        let payment_method = self.with_payment_method.then(|| PaymentMethod {
            id: Uuid::new_v4(),
            academy_id,
            student_id: student.id,
            billing_key: format!("bk_{}", student.id.simple()),
            customer_key: format!("cust_{}", student.id.simple()),
            card_label: Some("Shinhan ****1234".to_string()),
            status: PaymentMethodStatus::Active,
            created_at: now,
            revoked_at: None,
        });

        store.insert_student(student.clone());
        store.insert_plan(plan.clone());
        store.insert_subscription(subscription.clone());
        store.insert_invoice(invoice.clone());
        if let Some(method) = &payment_method {
            store.insert_payment_method(method.clone());
        }

        SeededSubscription {
            student,
            plan,
            subscription,
            invoice,
            payment_method,
        }
    }
}

/// Gateway double that answers from a queue of scripted outcomes and
/// approves every charge once the queue is empty.
#[derive(Default)]
pub struct ScriptedGateway {
    outcomes: Mutex<VecDeque<Result<ChargeReceipt, GatewayError>>>,
    requests: Mutex<Vec<ChargeRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: Result<ChargeReceipt, GatewayError>) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(outcome);
    }

    pub fn decline(&self, code: &str, message: &str) {
        self.push_outcome(Err(GatewayError::Provider {
            code: code.to_string(),
            message: message.to_string(),
        }));
    }

    pub fn requests(&self) -> Vec<ChargeRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge_with_billing_key(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeReceipt, GatewayError> {
        let call_no = {
            let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
            requests.push(request.clone());
            requests.len()
        };
        tokio::task::yield_now().await;

        let scripted = self
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        scripted.unwrap_or_else(|| {
            Ok(ChargeReceipt {
                payment_key: format!("pay_{:03}", call_no),
                order_id: request.order_id.clone(),
            })
        })
    }
}
