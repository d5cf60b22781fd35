//! Step list of the 6.3.0 -> 6.4.0 upgrade package.
//!
//! Order matters: schema objects are dropped before the package schema
//! applies, registry work runs only after the imported schema has been
//! refreshed, and the soft picklist dependency conversion comes last so
//! its per-module faults cannot shadow earlier ones.

use anyhow::{anyhow, Result};
use relaycrm_update_core::{BlockSpec, ColumnType, FieldSpec, Step, UpdateLogger};
use relaycrm_update_store_sqlite::{
    ActionMapping, ActionMappingKind, HandlerSpec, RelationSpec, SeedDelete, SeedInsert,
    SeedUpdate,
};
use serde_json::{json, Value};

use crate::RunContext;

const DROPPED_INDEXES: [(&str, &str); 2] = [
    ("crm_paymentsin", "paymentsin_status_idx"),
    ("crm_ossmailview", "ossmailview_date_idx"),
];

const DROPPED_COLUMNS: [(&str, &str); 2] = [
    ("crm_paymentsin", "paymentsno"),
    ("crm_users", "secondary_email"),
];

const DROPPED_FOREIGN_KEYS: [(&str, &str); 1] = [("crm_paymentsin", "fk_paymentsin_osspasswords")];

const DROPPED_TABLES: [&str; 2] = ["crm_osspasswords", "crm_osspasswords_seq"];

const MAIL_DEFAULT_PORT: u16 = 993;

pub fn main_steps() -> Vec<Step<'static, RunContext>> {
    vec![
        Step::new("load_importer_files", |ctx: &mut RunContext, _: &mut UpdateLogger| {
            ctx.importer.load_files(&ctx.package_dir)
        }),
        Step::new("remove_modules", |ctx: &mut RunContext, logger: &mut UpdateLogger| {
            ctx.store.remove_module(logger, "OSSPasswords")
        }),
        Step::new("pre_import_integrity", |ctx: &mut RunContext, _: &mut UpdateLogger| {
            ctx.importer
                .check_integrity(ctx.store.connection(), false)?;
            Ok(())
        }),
        Step::new("webmail_cache_rework", webmail_cache_rework),
        Step::new("normalize_project_budget", normalize_project_budget),
        Step::new("drop_indexes", |ctx: &mut RunContext, _: &mut UpdateLogger| {
            ctx.importer
                .drop_indexes(ctx.store.connection(), &DROPPED_INDEXES)
        }),
        Step::new("drop_foreign_keys", |ctx: &mut RunContext, _: &mut UpdateLogger| {
            ctx.importer
                .drop_foreign_keys(ctx.store.connection(), &DROPPED_FOREIGN_KEYS)
        }),
        Step::new("update_scheme", |ctx: &mut RunContext, _: &mut UpdateLogger| {
            ctx.importer.update_scheme(ctx.store.connection())
        }),
        Step::new("drop_columns", |ctx: &mut RunContext, _: &mut UpdateLogger| {
            ctx.importer
                .drop_columns(ctx.store.connection(), &DROPPED_COLUMNS)
        }),
        Step::new("drop_tables", |ctx: &mut RunContext, _: &mut UpdateLogger| {
            ctx.importer
                .drop_tables(ctx.store.connection(), &DROPPED_TABLES)
        }),
        Step::new("import_data", |ctx: &mut RunContext, _: &mut UpdateLogger| {
            ctx.importer.import_data(ctx.store.connection())
        }),
        Step::new("refresh_schema", |ctx: &mut RunContext, _: &mut UpdateLogger| {
            ctx.importer.refresh_schema(ctx.store.connection())
        }),
        Step::new("post_import_integrity", |ctx: &mut RunContext, _: &mut UpdateLogger| {
            ctx.importer.check_integrity(ctx.store.connection(), true)?;
            Ok(())
        }),
        Step::new("add_modules", |ctx: &mut RunContext, logger: &mut UpdateLogger| {
            ctx.store.install_module(logger, "SMSTemplates")?;
            ctx.store.enable_tracking("SMSTemplates")
        }),
        Step::new("add_fields", |ctx: &mut RunContext, logger: &mut UpdateLogger| {
            ctx.store.add_fields(logger, &new_fields())?;
            Ok(())
        }),
        Step::new("sms_notifier_rework", sms_notifier_rework),
        Step::new("set_relations", |ctx: &mut RunContext, logger: &mut UpdateLogger| {
            ctx.store.set_relations(logger, &new_relations())
        }),
        Step::new("add_action_mapping", |ctx: &mut RunContext, logger: &mut UpdateLogger| {
            ctx.store.apply_action_mappings(
                logger,
                &[ActionMapping {
                    name: "RecordConversion".to_string(),
                    kind: ActionMappingKind::Add,
                    modules: vec![
                        "FInvoiceProforma".to_string(),
                        "FInvoice".to_string(),
                    ],
                }],
            )
        }),
        Step::new("update_data", update_data),
        Step::new("picklist_dependency", |ctx: &mut RunContext, logger: &mut UpdateLogger| {
            let converted = ctx.store.rebuild_picklist_dependencies(logger)?;
            logger.info(&format!(
                "Converted picklist dependencies for {converted} modules"
            ))?;
            Ok(())
        }),
    ]
}

pub fn post_update_steps() -> Vec<Step<'static, RunContext>> {
    vec![
        Step::new("create_config_files", create_config_files),
        Step::new("update_mail_configuration", update_mail_configuration),
        Step::new("queue_batch_methods", |ctx: &mut RunContext, logger: &mut UpdateLogger| {
            let methods: [(&str, Value); 5] = [
                ("Maintenance::recalculateSums", json!(["crm_paymentsin"])),
                ("Maintenance::recalculateSums", json!(["crm_finvoice"])),
                ("Maintenance::rebuildLabels", json!([])),
                ("Maintenance::refreshSearchIndex", json!([])),
                ("Maintenance::pruneSessionStore", json!([])),
            ];
            let mut queued = 0;
            for (method, params) in &methods {
                if ctx.store.queue_batch_method(method, params)? {
                    queued += 1;
                }
            }
            logger.info(&format!("Queued {queued} maintenance methods"))?;
            Ok(())
        }),
        Step::new("clear_caches", |ctx: &mut RunContext, logger: &mut UpdateLogger| {
            ctx.store.clear_cache_table()?;
            relaycrm_update_core::recurse_delete(&ctx.site_dir.join("cache/templates_c"))?;
            logger.info("Cleared cache storage")?;
            Ok(())
        }),
    ]
}

fn webmail_cache_rework(ctx: &mut RunContext, logger: &mut UpdateLogger) -> Result<()> {
    ctx.importer
        .drop_tables(ctx.store.connection(), &["crm_webmail_cache"])?;
    ctx.store.connection().execute_batch(
        "CREATE TABLE IF NOT EXISTS crm_mail_cache (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           cache_key TEXT NOT NULL UNIQUE,
           payload TEXT NOT NULL,
           expires TEXT
         )",
    )?;
    logger.info("Rebuilt webmail cache storage")?;
    Ok(())
}

fn normalize_project_budget(ctx: &mut RunContext, logger: &mut UpdateLogger) -> Result<()> {
    if !ctx.store.table_present("crm_project")? {
        logger.info("Skip project budget normalization: no project table")?;
        return Ok(());
    }
    let blanked = ctx.store.batch_update(&SeedUpdate {
        table: "crm_project".to_string(),
        set: vec![("estimated_budget".to_string(), json!("0"))],
        filter: vec![("estimated_budget".to_string(), Value::Null)],
    })? + ctx.store.batch_update(&SeedUpdate {
        table: "crm_project".to_string(),
        set: vec![("estimated_budget".to_string(), json!("0"))],
        filter: vec![("estimated_budget".to_string(), json!(""))],
    })?;
    logger.info(&format!("Normalized {blanked} project budget values"))?;
    Ok(())
}

fn sms_notifier_rework(ctx: &mut RunContext, logger: &mut UpdateLogger) -> Result<()> {
    ctx.store.install_module(logger, "SMSNotifier")?;
    ctx.store.add_picklist_values(
        "smsnotifier_status",
        &["PLL_QUEUED", "PLL_SENT", "PLL_FAILED"],
    )?;
    ctx.store
        .set_close_state("smsnotifier_status", "PLL_SENT", true)?;
    ctx.store
        .set_close_state("smsnotifier_status", "PLL_FAILED", true)?;
    ctx.store.register_handler(&HandlerSpec {
        event_name: "EntityAfterSave".to_string(),
        handler_class: "SMSNotifier_SMSNotifierHandler_Handler".to_string(),
        is_active: true,
        include_modules: String::new(),
        exclude_modules: String::new(),
        priority: 5,
    })?;
    ctx.store.update_workflow_task_modules(
        "VTSMSTask",
        &json!({"include": ["Contacts", "Leads", "Accounts"]}),
    )?;
    Ok(())
}

fn update_data(ctx: &mut RunContext, logger: &mut UpdateLogger) -> Result<()> {
    let inserted = ctx.store.batch_insert(&SeedInsert {
        table: "crm_links".to_string(),
        columns: vec![
            "tabid".to_string(),
            "linktype".to_string(),
            "linklabel".to_string(),
            "linkurl".to_string(),
            "linkicon".to_string(),
        ],
        rows: vec![
            vec![
                json!(0),
                json!("DASHBOARDWIDGET"),
                json!("Multifilter"),
                json!("index.php?module=Home&view=ShowWidget&name=Multifilter"),
                Value::Null,
            ],
            vec![
                json!(0),
                json!("DASHBOARDWIDGET"),
                json!("Updates"),
                json!("index.php?module=Home&view=ShowWidget&name=Updates"),
                Value::Null,
            ],
        ],
    })?;
    ctx.store.batch_update(&SeedUpdate {
        table: "crm_fields".to_string(),
        set: vec![("quickcreate".to_string(), json!(0))],
        filter: vec![("fieldname".to_string(), json!("date_password_change"))],
    })?;
    ctx.store.batch_delete(&SeedDelete {
        table: "crm_eventhandlers".to_string(),
        filter: vec![(
            "handler_class".to_string(),
            json!("OSSPasswords_OSSPasswordsHandler_Handler"),
        )],
    })?;
    logger.info(&format!("Seeded {inserted} link rows"))?;
    Ok(())
}

fn create_config_files(ctx: &mut RunContext, logger: &mut UpdateLogger) -> Result<()> {
    let templates =
        relaycrm_update_core::ConfigTemplate::load_all(&ctx.package_dir.join("config-templates"))?;
    if templates.is_empty() {
        logger.info("Skip config regeneration: package ships no templates")?;
        return Ok(());
    }
    let config_dir = ctx.site_dir.join("config");
    for template in templates {
        let name = template.name.clone();
        let path = relaycrm_update_core::ConfigFile::new(template).create(&config_dir)?;
        logger.info(&format!("Created config file {name}: {}", path.display()))?;
    }
    Ok(())
}

fn update_mail_configuration(ctx: &mut RunContext, logger: &mut UpdateLogger) -> Result<()> {
    let path = ctx.site_dir.join("config/mail.json");
    let body = match std::fs::read_to_string(&path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            logger.warning("Skip mail configuration update: no mail config")?;
            return Ok(());
        }
        Err(err) => return Err(anyhow!("failed to read {}: {err}", path.display())),
    };
    let Value::Object(existing) = serde_json::from_str(&body)? else {
        return Err(anyhow!("mail config {} must be a JSON object", path.display()));
    };

    let migrated = relaycrm_update_core::migrate_mail_config(&existing, MAIL_DEFAULT_PORT);
    std::fs::write(&path, serde_json::to_string_pretty(&Value::Object(migrated))?)
        .map_err(|err| anyhow!("failed to write {}: {err}", path.display()))?;
    logger.info("Migrated mail configuration to the combined host format")?;
    Ok(())
}

fn new_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec {
            module: "PaymentsIn".to_string(),
            table: "crm_paymentsin".to_string(),
            column: "finvoiceproformaid".to_string(),
            name: "finvoiceproformaid".to_string(),
            label: "FL_FINVOICE_PROFORMA".to_string(),
            uitype: 10,
            column_type: ColumnType::Integer {
                width: 10,
                unsigned: true,
            },
            type_of_data: "I~O".to_string(),
            display_type: 1,
            presence: 2,
            quick_create: 1,
            mass_editable: 1,
            summary_field: 0,
            maximum_length: Some("0,4294967295".to_string()),
            default_value: None,
            field_params: None,
            block_label: "LBL_PAYMENT_INFORMATION".to_string(),
            block: Some(BlockSpec {
                label: "LBL_PAYMENT_INFORMATION".to_string(),
                sequence: 1,
                show_title: true,
                visible: true,
                icon: None,
            }),
            picklist_values: Vec::new(),
            related_modules: vec!["FInvoiceProforma".to_string()],
        },
        FieldSpec {
            module: "PaymentsIn".to_string(),
            table: "crm_paymentsin".to_string(),
            column: "paymentsin_status".to_string(),
            name: "paymentsin_status".to_string(),
            label: "FL_STATUS".to_string(),
            uitype: 16,
            column_type: ColumnType::VarChar { length: 255 },
            type_of_data: "V~M".to_string(),
            display_type: 1,
            presence: 2,
            quick_create: 1,
            mass_editable: 1,
            summary_field: 1,
            maximum_length: Some("255".to_string()),
            default_value: Some("PLL_CREATED".to_string()),
            field_params: None,
            block_label: "LBL_PAYMENT_INFORMATION".to_string(),
            block: Some(BlockSpec {
                label: "LBL_PAYMENT_INFORMATION".to_string(),
                sequence: 1,
                show_title: true,
                visible: true,
                icon: None,
            }),
            picklist_values: vec![
                "PLL_CREATED".to_string(),
                "PLL_UNDERWAY".to_string(),
                "PLL_PAID".to_string(),
            ],
            related_modules: Vec::new(),
        },
        FieldSpec {
            module: "Users".to_string(),
            table: "crm_users".to_string(),
            column: "date_password_change".to_string(),
            name: "date_password_change".to_string(),
            label: "FL_DATE_PASSWORD_CHANGE".to_string(),
            uitype: 5,
            column_type: ColumnType::DateTime,
            type_of_data: "DT~O".to_string(),
            display_type: 3,
            presence: 2,
            quick_create: 3,
            mass_editable: 0,
            summary_field: 0,
            maximum_length: None,
            default_value: None,
            field_params: None,
            block_label: "LBL_USER_ADV_OPTIONS".to_string(),
            block: Some(BlockSpec {
                label: "LBL_USER_ADV_OPTIONS".to_string(),
                sequence: 2,
                show_title: true,
                visible: true,
                icon: None,
            }),
            picklist_values: Vec::new(),
            related_modules: Vec::new(),
        },
    ]
}

fn new_relations() -> Vec<RelationSpec> {
    vec![
        RelationSpec {
            module: "FInvoice".to_string(),
            related_module: "PaymentsIn".to_string(),
            name: "getRelatedList".to_string(),
            label: "PaymentsIn".to_string(),
            actions: vec!["ADD".to_string(), "SELECT".to_string()],
            view_type: "RelatedTab".to_string(),
        },
        RelationSpec {
            module: "FInvoiceProforma".to_string(),
            related_module: "PaymentsIn".to_string(),
            name: "getRelatedList".to_string(),
            label: "PaymentsIn".to_string(),
            actions: vec!["ADD".to_string(), "SELECT".to_string()],
            view_type: "RelatedTab".to_string(),
        },
    ]
}
