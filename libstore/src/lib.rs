pub mod etcd;
pub mod keys;
pub mod memory;
pub mod selector;
pub mod store;

pub use etcd::EtcdStore;
pub use memory::MemStore;
pub use selector::Selector;
pub use store::{
    DocumentStore, StoreError, StoreEvent, WatchFeed, find_json, get_json, put_json,
};
