mod competition;
mod supervision;
