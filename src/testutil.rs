//! In-memory remote server used by service and reconciler tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{Local, NaiveDate};

use crate::models::{
    ConsumptionEntry, DailyStats, EntityId, Goal, HistoryDay, NewConsumption, NewGoal, NewProduct,
    Product, UpdateConsumption, UpdateProduct, compute_daily_stats,
};
use crate::remote::{RemoteApi, RemoteError, RemoteErrorKind};

#[derive(Default)]
struct ServerState {
    next_id: i64,
    products: Vec<Product>,
    consumptions: Vec<ConsumptionEntry>,
    goals: Vec<Goal>,
}

impl ServerState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Inner {
    state: Mutex<ServerState>,
    unreachable: AtomicBool,
    forced: Mutex<HashMap<&'static str, RemoteError>>,
    calls: AtomicUsize,
}

/// Cloneable handle to one shared in-memory server.
#[derive(Clone)]
pub struct MockRemote(Arc<Inner>);

impl MockRemote {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            state: Mutex::new(ServerState::default()),
            unreachable: AtomicBool::new(false),
            forced: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }))
    }

    /// Make every call fail with a network-class error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.0.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make the named method fail with `error` until cleared.
    pub fn force_error(&self, method: &'static str, error: RemoteError) {
        self.0.forced.lock().unwrap().insert(method, error);
    }

    pub fn clear_error(&self, method: &'static str) {
        self.0.forced.lock().unwrap().remove(method);
    }

    pub fn call_count(&self) -> usize {
        self.0.calls.load(Ordering::SeqCst)
    }

    pub fn product_count(&self, user_id: i64) -> usize {
        self.0
            .state
            .lock()
            .unwrap()
            .products
            .iter()
            .filter(|p| p.user_id == user_id)
            .count()
    }

    pub fn consumption_count(&self, user_id: i64) -> usize {
        self.0
            .state
            .lock()
            .unwrap()
            .consumptions
            .iter()
            .filter(|e| e.user_id == user_id)
            .count()
    }

    pub fn server_products(&self, user_id: i64) -> Vec<Product> {
        self.0
            .state
            .lock()
            .unwrap()
            .products
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn server_consumptions(&self, user_id: i64) -> Vec<ConsumptionEntry> {
        self.0
            .state
            .lock()
            .unwrap()
            .consumptions
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn server_goal(&self, user_id: i64) -> Option<Goal> {
        self.0
            .state
            .lock()
            .unwrap()
            .goals
            .iter()
            .find(|g| g.user_id == user_id)
            .cloned()
    }

    pub fn seed_product(
        &self,
        user_id: i64,
        name: &str,
        calories: f64,
        protein: f64,
        fat: f64,
        carbs: f64,
    ) -> Product {
        let mut state = self.0.state.lock().unwrap();
        let product = Product {
            id: EntityId::Remote(state.next_id()),
            user_id,
            name: name.to_string(),
            calories,
            protein,
            fat,
            carbs,
            created_at: Local::now().to_rfc3339(),
        };
        state.products.push(product.clone());
        product
    }

    /// Per-call preamble: count the call, yield once so concurrent callers
    /// interleave, then apply the failure knobs.
    async fn begin(&self, method: &'static str) -> Result<(), RemoteError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.0.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::network("connection refused"));
        }
        if let Some(err) = self.0.forced.lock().unwrap().get(method) {
            return Err(err.clone());
        }
        Ok(())
    }
}

impl RemoteApi for MockRemote {
    async fn products(&self, user_id: i64) -> Result<Vec<Product>, RemoteError> {
        self.begin("products").await?;
        Ok(self.server_products(user_id))
    }

    async fn create_product(
        &self,
        user_id: i64,
        new: &NewProduct,
    ) -> Result<Product, RemoteError> {
        self.begin("create_product").await?;
        let mut state = self.0.state.lock().unwrap();
        let product = Product {
            id: EntityId::Remote(state.next_id()),
            user_id,
            name: new.name.clone(),
            calories: new.calories,
            protein: new.protein,
            fat: new.fat,
            carbs: new.carbs,
            created_at: Local::now().to_rfc3339(),
        };
        state.products.push(product.clone());
        Ok(product)
    }

    async fn update_product(
        &self,
        user_id: i64,
        id: i64,
        update: &UpdateProduct,
    ) -> Result<Product, RemoteError> {
        self.begin("update_product").await?;
        let mut state = self.0.state.lock().unwrap();
        let product = state
            .products
            .iter_mut()
            .find(|p| p.user_id == user_id && p.id == EntityId::Remote(id))
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::NotFound, "no such product"))?;
        if let Some(name) = &update.name {
            product.name.clone_from(name);
        }
        if let Some(calories) = update.calories {
            product.calories = calories;
        }
        if let Some(protein) = update.protein {
            product.protein = protein;
        }
        if let Some(fat) = update.fat {
            product.fat = fat;
        }
        if let Some(carbs) = update.carbs {
            product.carbs = carbs;
        }
        Ok(product.clone())
    }

    async fn delete_product(&self, user_id: i64, id: i64) -> Result<(), RemoteError> {
        self.begin("delete_product").await?;
        let mut state = self.0.state.lock().unwrap();
        let before = state.products.len();
        state
            .products
            .retain(|p| !(p.user_id == user_id && p.id == EntityId::Remote(id)));
        if state.products.len() == before {
            return Err(RemoteError::new(RemoteErrorKind::NotFound, "no such product"));
        }
        Ok(())
    }

    async fn create_consumption(
        &self,
        user_id: i64,
        product_id: i64,
        new: &NewConsumption,
    ) -> Result<ConsumptionEntry, RemoteError> {
        self.begin("create_consumption").await?;
        let mut state = self.0.state.lock().unwrap();
        if !state
            .products
            .iter()
            .any(|p| p.user_id == user_id && p.id == EntityId::Remote(product_id))
        {
            return Err(RemoteError::new(RemoteErrorKind::NotFound, "no such product"));
        }
        let entry = ConsumptionEntry {
            id: EntityId::Remote(state.next_id()),
            user_id,
            product_id: EntityId::Remote(product_id),
            amount: new.amount,
            date: new.date.unwrap_or_else(|| Local::now().date_naive()),
            created_at: Local::now().to_rfc3339(),
        };
        state.consumptions.push(entry.clone());
        Ok(entry)
    }

    async fn update_consumption(
        &self,
        user_id: i64,
        id: i64,
        update: &UpdateConsumption,
    ) -> Result<ConsumptionEntry, RemoteError> {
        self.begin("update_consumption").await?;
        let mut state = self.0.state.lock().unwrap();
        let entry = state
            .consumptions
            .iter_mut()
            .find(|e| e.user_id == user_id && e.id == EntityId::Remote(id))
            .ok_or_else(|| RemoteError::new(RemoteErrorKind::NotFound, "no such entry"))?;
        if let Some(amount) = update.amount {
            entry.amount = amount;
        }
        if let Some(date) = update.date {
            entry.date = date;
        }
        Ok(entry.clone())
    }

    async fn delete_consumption(&self, user_id: i64, id: i64) -> Result<(), RemoteError> {
        self.begin("delete_consumption").await?;
        let mut state = self.0.state.lock().unwrap();
        let before = state.consumptions.len();
        state
            .consumptions
            .retain(|e| !(e.user_id == user_id && e.id == EntityId::Remote(id)));
        if state.consumptions.len() == before {
            return Err(RemoteError::new(RemoteErrorKind::NotFound, "no such entry"));
        }
        Ok(())
    }

    async fn consumption_by_date(
        &self,
        user_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<ConsumptionEntry>, RemoteError> {
        self.begin("consumption_by_date").await?;
        Ok(self
            .server_consumptions(user_id)
            .into_iter()
            .filter(|e| e.date == date)
            .collect())
    }

    async fn daily_stats(&self, user_id: i64, date: NaiveDate) -> Result<DailyStats, RemoteError> {
        self.begin("daily_stats").await?;
        let entries = self.server_consumptions(user_id);
        let products: HashMap<EntityId, Product> = self
            .server_products(user_id)
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        Ok(compute_daily_stats(date, &entries, &products))
    }

    async fn history(&self, user_id: i64, days: u32) -> Result<Vec<HistoryDay>, RemoteError> {
        self.begin("history").await?;
        let entries = self.server_consumptions(user_id);
        let products: HashMap<EntityId, Product> = self
            .server_products(user_id)
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        let today = Local::now().date_naive();

        let mut history = Vec::new();
        for offset in 0..u64::from(days) {
            let Some(date) = today.checked_sub_days(chrono::Days::new(offset)) else {
                break;
            };
            let stats = compute_daily_stats(date, &entries, &products);
            if stats.consumptions_count == 0 {
                continue;
            }
            let day_entries = entries.iter().filter(|e| e.date == date).cloned().collect();
            history.push(HistoryDay {
                stats,
                entries: day_entries,
            });
        }
        Ok(history)
    }

    async fn goal(&self, user_id: i64) -> Result<Option<Goal>, RemoteError> {
        self.begin("goal").await?;
        Ok(self.server_goal(user_id))
    }

    async fn upsert_goal(&self, user_id: i64, new: &NewGoal) -> Result<Goal, RemoteError> {
        self.begin("upsert_goal").await?;
        let mut state = self.0.state.lock().unwrap();
        let goal = Goal {
            id: EntityId::Remote(state.next_id()),
            user_id,
            daily_calories: new.daily_calories,
            daily_protein: new.daily_protein,
            daily_fat: new.daily_fat,
            daily_carbs: new.daily_carbs,
            goal_type: new.goal_type.clone(),
            created_at: Local::now().to_rfc3339(),
        };
        state.goals.retain(|g| g.user_id != user_id);
        state.goals.push(goal.clone());
        Ok(goal)
    }
}
