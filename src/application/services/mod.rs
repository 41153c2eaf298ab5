pub mod fill_reconciler;
