//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `spots` - Spot records (key: spot_id)
//! - `reservations` - Reservation records (key: reservation_id)
//! - `zone_index` - Zone membership (key: zone_id || 0x00 || spot_id)
//! - `holder_index` - Reservations per driver (key: holder_id || 0x00 || reservation_id)
//! - `pending_index` - Reservations stored as Pending (key: reservation_id)
//! - `zone_meta` - Zone revision, big-endian u64 (key: zone_id)
//!
//! Conditional writes take a striped lock on the record key, compare the
//! stored version and commit record plus index changes in one `WriteBatch`.
//! Spot writes also hold the stripe of each zone they touch, in stripe
//! order, and carry the new zone revision in the same batch.

use crate::{
    config::StorageConfig,
    error::{Error, Result},
    store::{check_version, Store},
    types::{HolderId, Reservation, ReservationId, ReservationState, Spot, SpotId, ZoneId},
};
use parking_lot::{Mutex, MutexGuard};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Column family names
const CF_SPOTS: &str = "spots";
const CF_RESERVATIONS: &str = "reservations";
const CF_ZONE_INDEX: &str = "zone_index";
const CF_HOLDER_INDEX: &str = "holder_index";
const CF_PENDING_INDEX: &str = "pending_index";
const CF_ZONE_META: &str = "zone_meta";

const LOCK_STRIPES: usize = 64;

/// RocksDB-backed [`Store`]
pub struct RocksStore {
    db: Arc<DB>,
    stripes: Vec<Mutex<()>>,
    zone_stripes: Vec<Mutex<()>>,
}

impl RocksStore {
    /// Open or create database
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.max_background_jobs);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_SPOTS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_RESERVATIONS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_ZONE_INDEX, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_HOLDER_INDEX, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_PENDING_INDEX, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_ZONE_META, Self::cf_options_indices()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened RocksDB spot store");

        Ok(Self {
            db: Arc::new(db),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            zone_stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    // Column family options

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        // Records are read on every request, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    // Helpers

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn slot(key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % LOCK_STRIPES
    }

    fn stripe(&self, key: &[u8]) -> &Mutex<()> {
        &self.stripes[Self::slot(key)]
    }

    /// Lock the stripes of `zones` in ascending order
    fn lock_zones(&self, zones: &[&ZoneId]) -> Vec<MutexGuard<'_, ()>> {
        let mut slots: Vec<usize> = zones
            .iter()
            .map(|zone| Self::slot(zone.as_str().as_bytes()))
            .collect();
        slots.sort_unstable();
        slots.dedup();
        slots.into_iter().map(|i| self.zone_stripes[i].lock()).collect()
    }

    /// Stage the next revision of a zone; caller holds its zone stripe
    fn bump_zone(
        &self,
        batch: &mut WriteBatch,
        cf: &Arc<BoundColumnFamily<'_>>,
        zone_id: &ZoneId,
    ) -> Result<()> {
        let next = self.zone_revision(zone_id)? + 1;
        batch.put_cf(cf, zone_id.as_str().as_bytes(), next.to_be_bytes());
        Ok(())
    }

    fn get_record<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf_handle(cf)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Keys under `prefix` in an index column family, with the prefix stripped
    fn scan_index(&self, cf: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        let cf = self.cf_handle(cf)?;
        let mut suffixes = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            suffixes.push(key[prefix.len()..].to_vec());
        }
        Ok(suffixes)
    }

    fn index_key(prefix: &str, suffix: &[u8]) -> Vec<u8> {
        let mut key = prefix.as_bytes().to_vec();
        key.push(0); // Separator
        key.extend_from_slice(suffix);
        key
    }
}

impl Store for RocksStore {
    fn get_spot(&self, spot_id: &SpotId) -> Result<Option<Spot>> {
        self.get_record(CF_SPOTS, spot_id.as_str().as_bytes())
    }

    fn put_spot(&self, spot: &Spot, expected_version: Option<u64>) -> Result<()> {
        let key = spot.id.as_str().as_bytes();
        let _guard = self.stripe(key).lock();

        let current: Option<Spot> = self.get_record(CF_SPOTS, key)?;
        check_version("spot", &spot.id, expected_version, current.as_ref().map(|s| s.version))?;

        let previous_zone = current
            .map(|s| s.zone_id)
            .filter(|zone_id| zone_id != &spot.zone_id);
        let mut zones = vec![&spot.zone_id];
        zones.extend(previous_zone.as_ref());
        let _zone_guards = self.lock_zones(&zones);

        let cf_spots = self.cf_handle(CF_SPOTS)?;
        let cf_zone = self.cf_handle(CF_ZONE_INDEX)?;
        let cf_meta = self.cf_handle(CF_ZONE_META)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_spots, key, bincode::serialize(spot)?);
        if let Some(previous) = &previous_zone {
            batch.delete_cf(&cf_zone, Self::index_key(previous.as_str(), key));
        }
        batch.put_cf(&cf_zone, Self::index_key(spot.zone_id.as_str(), key), b"");
        for zone_id in &zones {
            self.bump_zone(&mut batch, &cf_meta, zone_id)?;
        }

        self.db.write(batch)?;
        Ok(())
    }

    fn delete_spot(&self, spot_id: &SpotId, expected_version: u64) -> Result<()> {
        let key = spot_id.as_str().as_bytes();
        let _guard = self.stripe(key).lock();

        let current: Spot = self
            .get_record(CF_SPOTS, key)?
            .ok_or_else(|| Error::NotFound(format!("spot {}", spot_id)))?;
        check_version("spot", spot_id, Some(expected_version), Some(current.version))?;

        let _zone_guards = self.lock_zones(&[&current.zone_id]);

        let cf_spots = self.cf_handle(CF_SPOTS)?;
        let cf_zone = self.cf_handle(CF_ZONE_INDEX)?;
        let cf_meta = self.cf_handle(CF_ZONE_META)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_spots, key);
        batch.delete_cf(&cf_zone, Self::index_key(current.zone_id.as_str(), key));
        self.bump_zone(&mut batch, &cf_meta, &current.zone_id)?;
        self.db.write(batch)?;
        Ok(())
    }

    fn zone_revision(&self, zone_id: &ZoneId) -> Result<u64> {
        let cf = self.cf_handle(CF_ZONE_META)?;
        match self.db.get_cf(&cf, zone_id.as_str().as_bytes())? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    Error::Storage(format!("corrupt revision for zone {}", zone_id))
                })?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    fn spots_in_zone(&self, zone_id: &ZoneId) -> Result<Vec<Spot>> {
        let prefix = Self::index_key(zone_id.as_str(), &[]);
        let mut spots = Vec::new();
        for spot_key in self.scan_index(CF_ZONE_INDEX, &prefix)? {
            if let Some(spot) = self.get_record::<Spot>(CF_SPOTS, &spot_key)? {
                spots.push(spot);
            }
        }
        Ok(spots)
    }

    fn all_spots(&self) -> Result<Vec<Spot>> {
        let cf = self.cf_handle(CF_SPOTS)?;
        let mut spots = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            spots.push(bincode::deserialize(&value)?);
        }
        Ok(spots)
    }

    fn get_reservation(&self, reservation_id: &ReservationId) -> Result<Option<Reservation>> {
        self.get_record(CF_RESERVATIONS, reservation_id.as_uuid().as_bytes())
    }

    fn put_reservation(
        &self,
        reservation: &Reservation,
        expected_version: Option<u64>,
    ) -> Result<()> {
        let key = reservation.id.as_uuid().as_bytes();
        let _guard = self.stripe(key).lock();

        let current: Option<Reservation> = self.get_record(CF_RESERVATIONS, key)?;
        check_version(
            "reservation",
            reservation.id,
            expected_version,
            current.as_ref().map(|r| r.version),
        )?;

        let cf_reservations = self.cf_handle(CF_RESERVATIONS)?;
        let cf_holder = self.cf_handle(CF_HOLDER_INDEX)?;
        let cf_pending = self.cf_handle(CF_PENDING_INDEX)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_reservations, key, bincode::serialize(reservation)?);
        batch.put_cf(
            &cf_holder,
            Self::index_key(reservation.holder_id.as_str(), key),
            b"",
        );
        if reservation.state == ReservationState::Pending {
            batch.put_cf(&cf_pending, key, b"");
        } else {
            batch.delete_cf(&cf_pending, key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    fn delete_reservation(&self, reservation_id: &ReservationId) -> Result<()> {
        let key = reservation_id.as_uuid().as_bytes();
        let _guard = self.stripe(key).lock();

        let Some(current) = self.get_record::<Reservation>(CF_RESERVATIONS, key)? else {
            return Ok(());
        };

        let cf_reservations = self.cf_handle(CF_RESERVATIONS)?;
        let cf_holder = self.cf_handle(CF_HOLDER_INDEX)?;
        let cf_pending = self.cf_handle(CF_PENDING_INDEX)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_reservations, key);
        batch.delete_cf(&cf_holder, Self::index_key(current.holder_id.as_str(), key));
        batch.delete_cf(&cf_pending, key);
        self.db.write(batch)?;
        Ok(())
    }

    fn pending_reservations(&self) -> Result<Vec<Reservation>> {
        let cf = self.cf_handle(CF_PENDING_INDEX)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            keys.push(key);
        }

        let mut pending = Vec::new();
        for key in keys {
            if let Some(reservation) = self.get_record::<Reservation>(CF_RESERVATIONS, &key)? {
                if reservation.state == ReservationState::Pending {
                    pending.push(reservation);
                }
            }
        }
        Ok(pending)
    }

    fn reservations_for_holder(&self, holder_id: &HolderId) -> Result<Vec<Reservation>> {
        let prefix = Self::index_key(holder_id.as_str(), &[]);
        let mut reservations = Vec::new();
        for key in self.scan_index(CF_HOLDER_INDEX, &prefix)? {
            if let Some(reservation) = self.get_record(CF_RESERVATIONS, &key)? {
                reservations.push(reservation);
            }
        }
        Ok(reservations)
    }
}
