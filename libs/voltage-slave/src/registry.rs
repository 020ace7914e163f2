//! Per-address data table registry
//!
//! 256 slots, one per slave address. Each table sits behind its own mutex so
//! concurrent TCP sessions serialise per table; different tables never
//! contend. The registry itself is read-only once serving starts.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::table::DataTable;
use crate::types::Address;

/// Table shared between the registry and the host application
pub type SharedTable = Arc<Mutex<dyn DataTable>>;

const SLOTS: usize = 256;

/// Maps slave addresses to data tables
#[derive(Clone)]
pub struct DataTableRegistry {
    tables: Vec<Option<SharedTable>>,
}

impl Default for DataTableRegistry {
    fn default() -> Self {
        Self {
            tables: vec![None; SLOTS],
        }
    }
}

impl std::fmt::Debug for DataTableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTableRegistry")
            .field("addresses", &self.addresses().collect::<Vec<_>>())
            .finish()
    }
}

impl DataTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `table` at `address`, replacing any previous table
    ///
    /// Returns the shared handle so the host can keep updating the table.
    pub fn add_data_table<T>(&mut self, address: Address, table: T) -> SharedTable
    where
        T: DataTable + 'static,
    {
        let shared: SharedTable = Arc::new(Mutex::new(table));
        self.add_shared(address, Arc::clone(&shared));
        shared
    }

    /// Register an existing shared table (one table may serve several addresses)
    pub fn add_shared(&mut self, address: Address, table: SharedTable) {
        let slot = &mut self.tables[usize::from(address.value())];
        if slot.replace(table).is_some() {
            debug!("Replaced data table for slave {}", address);
        }
    }

    pub fn remove(&mut self, address: Address) -> Option<SharedTable> {
        self.tables[usize::from(address.value())].take()
    }

    pub fn get(&self, address: Address) -> Option<&SharedTable> {
        self.tables[usize::from(address.value())].as_ref()
    }

    pub fn contains(&self, address: Address) -> bool {
        self.get(address).is_some()
    }

    /// Tables a request to `address` is executed against
    ///
    /// Broadcast fans out to every registered table; a unicast address yields
    /// its table, or nothing when unregistered.
    pub fn targets(&self, address: Address) -> Vec<SharedTable> {
        if address.is_broadcast() {
            self.tables.iter().flatten().cloned().collect()
        } else {
            self.get(address).cloned().into_iter().collect()
        }
    }

    /// Registered addresses in ascending order
    pub fn addresses(&self) -> impl Iterator<Item = Address> + '_ {
        self.tables
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(i, _)| Address(i as u8))
    }

    pub fn len(&self) -> usize {
        self.tables.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
