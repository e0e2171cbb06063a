use maud::{html, Markup, PreEscaped, DOCTYPE};

use crate::dashboard::{Aggregates, Notification, NotificationKind};
use crate::profile::ProfileView;
use crate::provisioning::ImportReport;
use crate::session::AdminSession;
use crate::types::ApprovedUser;

const DATE_FORMAT: &str = "%d/%m/%Y %H:%M";

/// Inline message shown at the top of a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Success(String),
    Error(String),
}

impl Notice {
    fn render(&self) -> Markup {
        match self {
            Notice::Success(msg) => html! { div.notice.success role="status" { (msg) } },
            Notice::Error(msg) => html! { div.notice.error role="alert" { (msg) } },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Dashboard,
    Users,
    Profile,
}

fn layout(title: &str, session: Option<&AdminSession>, active: Option<Page>, body: Markup) -> Markup {
    html! {
        (DOCTYPE)
        html lang="fr" {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { (title) " · SecurAuto" }
                style { (PreEscaped(CSS)) }
            }
            body {
                @if let Some(session) = session {
                    (nav(session, active))
                }
                main.container {
                    (body)
                }
            }
        }
    }
}

fn nav(session: &AdminSession, active: Option<Page>) -> Markup {
    let link = |page: Page, href: &str, label: &str| {
        html! {
            a href=(href) class=[(active == Some(page)).then_some("active")] { (label) }
        }
    };
    html! {
        nav.topbar {
            span.brand { "SecurAuto" }
            @if session.legion().is_some() {
                (link(Page::Dashboard, "/dashboard", "Tableau de bord"))
            }
            (link(Page::Users, "/users", "Utilisateurs"))
            (link(Page::Profile, "/profile", "Profil"))
            span.who { (session.admin.name()) }
            form.logout method="post" action="/logout" {
                button type="submit" { "Déconnexion" }
            }
        }
    }
}

pub fn login_page(email: &str, notice: Option<&Notice>) -> Markup {
    layout(
        "Connexion",
        None,
        None,
        html! {
            section.card.login {
                h1 { "SecurAuto" }
                p.subtitle { "Espace administrateur" }
                @if let Some(notice) = notice {
                    (notice.render())
                }
                form method="post" action="/login" {
                    label for="email" { "Email" }
                    input #email type="email" name="email" value=(email) required autofocus;
                    label for="password" { "Mot de passe" }
                    input #password type="password" name="password" required;
                    button type="submit" { "Se connecter" }
                }
            }
        },
    )
}

pub fn users_page(
    session: &AdminSession,
    users: &[ApprovedUser],
    notice: Option<&Notice>,
    report: Option<&ImportReport>,
) -> Markup {
    layout(
        "Utilisateurs",
        Some(session),
        Some(Page::Users),
        html! {
            h1 { "Utilisateurs autorisés" }
            @if let Some(notice) = notice {
                (notice.render())
            }
            @if let Some(report) = report {
                (render_import_report(report))
            }
            div.columns {
                section.card {
                    h2 { "Ajouter un utilisateur" }
                    form method="post" action="/users" {
                        label for="first_name" { "Prénom" }
                        input #first_name name="first_name" required;
                        label for="last_name" { "Nom" }
                        input #last_name name="last_name" required;
                        label for="matricule" { "Matricule" }
                        input #matricule name="matricule" required;
                        label for="assignment" { "Lieu d'affectation" }
                        input #assignment name="assignment" required;
                        button type="submit" { "Ajouter" }
                    }
                }
                section.card {
                    h2 { "Importer un fichier" }
                    p.hint { "Colonnes : prénom, nom, matricule, lieu d'affectation. La première ligne est ignorée." }
                    form method="post" action="/users/import" enctype="multipart/form-data" {
                        input type="file" name="file" accept=".xlsx,.xls,.ods,.xml" required;
                        button type="submit" { "Importer" }
                    }
                }
            }
            section.card {
                h2 { "Derniers ajouts" }
                @if users.is_empty() {
                    p.empty-state { "Aucun utilisateur pour le moment." }
                } @else {
                    table {
                        thead {
                            tr { th { "Nom" } th { "Matricule" } th { "Affectation" } th { "Ajouté le" } th { "Par" } }
                        }
                        tbody {
                            @for user in users {
                                tr {
                                    td { (user.display_name) }
                                    td { (user.matricule) }
                                    td { (user.assignment) }
                                    td { (user.created_at.format(DATE_FORMAT)) }
                                    td { (user.created_by) }
                                }
                            }
                        }
                    }
                }
            }
        },
    )
}

fn render_import_report(report: &ImportReport) -> Markup {
    let class = if report.errors == 0 { "notice success" } else { "notice error" };
    html! {
        div class=(class) {
            (report.imported) " utilisateur(s) importé(s), " (report.errors) " erreur(s)"
            @if !report.row_errors.is_empty() {
                ul.row-errors {
                    @for err in &report.row_errors {
                        li { "Ligne " (err.line) " : " (err.message) }
                    }
                }
            }
        }
    }
}

pub fn dashboard_page(session: &AdminSession, aggregates: &Aggregates) -> Markup {
    let summary = &aggregates.summary;
    layout(
        "Tableau de bord",
        Some(session),
        Some(Page::Dashboard),
        html! {
            div.page-header {
                h1 { "Légion " (aggregates.legion) }
                a.button href="/dashboard/export.csv" { "Exporter CSV" }
            }
            div.stats {
                (stat("Détections", summary.total_detections))
                (stat("Véhicules volés détectés", summary.stolen_detections))
                (stat("Véhicules signalés", summary.stolen_vehicles))
                (stat("Contrôles", summary.vehicle_checks))
            }
            div.columns {
                section.card {
                    h2 { "Détections par mois" }
                    canvas #"detections-chart" {}
                }
                section.card {
                    h2 { "Véhicules volés par statut" }
                    canvas #"status-chart" {}
                }
            }
            section.card {
                h2 { "Notifications en direct" }
                div #feed { p.empty-state { "Connexion au flux…" } }
            }
            script src="https://cdn.jsdelivr.net/npm/chart.js@4" {}
            script { (PreEscaped(DASHBOARD_JS)) }
        },
    )
}

fn stat(label: &str, value: usize) -> Markup {
    html! {
        div.stat {
            span.value { (value) }
            span.label { (label) }
        }
    }
}

/// Live feed fragment pushed over the notification stream
pub fn render_feed(notifications: &[Notification]) -> Markup {
    html! {
        @if notifications.is_empty() {
            p.empty-state { "Aucune détection récente." }
        } @else {
            ul.feed {
                @for n in notifications {
                    @let (class, badge) = badge(n.kind);
                    li class=(class) {
                        span.badge { (badge) }
                        span.plate { (n.plate) }
                        span.meta { (n.user) " · " (n.timestamp.format(DATE_FORMAT)) }
                    }
                }
            }
        }
    }
}

fn badge(kind: NotificationKind) -> (&'static str, &'static str) {
    match kind {
        NotificationKind::Stolen => ("stolen", "VOLÉ"),
        NotificationKind::Clean => ("clean", "RAS"),
    }
}

pub fn profile_page(session: &AdminSession, view: &ProfileView, notice: Option<&Notice>) -> Markup {
    let profile = &view.profile;
    layout(
        "Profil",
        Some(session),
        Some(Page::Profile),
        html! {
            h1 { "Mon profil" }
            @if let Some(notice) = notice {
                (notice.render())
            }
            div.columns {
                section.card {
                    h2 { "Compte" }
                    dl {
                        dt { "Email" } dd { (profile.email) }
                        dt { "Rôle" } dd { (profile.role.label()) }
                        dt { "Légion" } dd { (profile.legion().unwrap_or("Aucune")) }
                        dt { "Dernière connexion" }
                        dd {
                            @match profile.last_login {
                                Some(ts) => { (ts.format(DATE_FORMAT)) }
                                None => { "Jamais" }
                            }
                        }
                        dt { "Créé le" } dd { (profile.created_at.format(DATE_FORMAT)) }
                    }
                }
                section.card {
                    h2 { "Activité" }
                    div.stats {
                        (stat("Connexions ce mois", view.monthly_logins))
                        (stat("Actions enregistrées", view.total_actions))
                    }
                    @if let Some(last) = &view.last_action {
                        p.hint {
                            "Dernière action : " (last.action.label()) " le " (last.timestamp.format(DATE_FORMAT))
                        }
                    }
                }
            }
            div.columns {
                section.card {
                    h2 { "Nom d'affichage" }
                    form method="post" action="/profile/name" {
                        label for="display_name" { "Nom" }
                        input #display_name name="display_name" value=(profile.display_name) required;
                        button type="submit" { "Enregistrer" }
                    }
                }
                section.card {
                    h2 { "Mot de passe" }
                    form method="post" action="/profile/password" {
                        label for="current" { "Mot de passe actuel" }
                        input #current type="password" name="current" required;
                        label for="new" { "Nouveau mot de passe" }
                        input #new type="password" name="new" minlength="8" required;
                        label for="confirm" { "Confirmation" }
                        input #confirm type="password" name="confirm" minlength="8" required;
                        button type="submit" { "Changer" }
                    }
                }
            }
            section.card {
                h2 { "Historique des connexions" }
                @if view.login_history.is_empty() {
                    p.empty-state { "Aucune connexion enregistrée." }
                } @else {
                    ul.history {
                        @for entry in &view.login_history {
                            li { (entry.timestamp.format(DATE_FORMAT)) }
                        }
                    }
                }
            }
        },
    )
}

const CSS: &str = r#"
* { margin: 0; padding: 0; box-sizing: border-box; }

body {
    font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif;
    background: #f3f5f8;
    color: #1c2430;
    line-height: 1.45;
}

.topbar {
    display: flex;
    align-items: center;
    gap: 20px;
    padding: 12px 24px;
    background: #0f2a47;
    color: #fff;
}

.topbar a { color: #c9d6e6; text-decoration: none; font-weight: 600; }
.topbar a.active, .topbar a:hover { color: #fff; }
.topbar .brand { font-weight: 800; letter-spacing: 0.05em; margin-right: 12px; }
.topbar .who { margin-left: auto; color: #c9d6e6; }
.topbar .logout button { background: transparent; border: 1px solid #c9d6e6; color: #fff; }

.container { max-width: 1100px; margin: 0 auto; padding: 32px 24px 60px; }

h1 { font-size: 1.8em; margin-bottom: 20px; }
h2 { font-size: 1.1em; margin-bottom: 14px; }

.card {
    background: #fff;
    border: 1px solid #dde3ea;
    border-radius: 8px;
    padding: 20px;
    margin-bottom: 20px;
}

.card.login { max-width: 380px; margin: 80px auto; }
.subtitle { color: #5b6b7d; margin-bottom: 16px; }

.columns { display: grid; grid-template-columns: repeat(auto-fit, minmax(320px, 1fr)); gap: 20px; }

label { display: block; font-size: 0.85em; font-weight: 600; margin: 10px 0 4px; }
input { width: 100%; padding: 8px 10px; border: 1px solid #c3ccd6; border-radius: 4px; }
input[type=file] { border: none; padding: 8px 0; }

button, .button {
    display: inline-block;
    margin-top: 14px;
    padding: 8px 16px;
    background: #1d5fa8;
    color: #fff;
    border: none;
    border-radius: 4px;
    font-weight: 600;
    cursor: pointer;
    text-decoration: none;
}

.topbar .logout button { margin-top: 0; }

.notice { padding: 12px 16px; border-radius: 6px; margin-bottom: 20px; }
.notice.success { background: #e3f4e8; color: #1b5e31; }
.notice.error { background: #fbe4e4; color: #8a1f1f; }
.row-errors { margin: 8px 0 0 18px; font-size: 0.9em; }

.hint, .empty-state { color: #5b6b7d; font-size: 0.9em; }

.page-header { display: flex; justify-content: space-between; align-items: center; }
.page-header .button { margin-top: 0; }

.stats { display: flex; flex-wrap: wrap; gap: 16px; margin-bottom: 20px; }
.stat { flex: 1; min-width: 150px; background: #fff; border: 1px solid #dde3ea; border-radius: 8px; padding: 14px; }
.stat .value { display: block; font-size: 1.8em; font-weight: 800; }
.stat .label { color: #5b6b7d; font-size: 0.85em; }

table { width: 100%; border-collapse: collapse; }
th, td { text-align: left; padding: 8px; border-bottom: 1px solid #eef1f4; font-size: 0.92em; }

dl { display: grid; grid-template-columns: max-content 1fr; gap: 6px 16px; }
dt { color: #5b6b7d; }

.feed, .history { list-style: none; }
.feed li { display: flex; gap: 12px; align-items: center; padding: 8px 0; border-bottom: 1px solid #eef1f4; }
.feed .badge { font-size: 0.75em; font-weight: 800; padding: 2px 8px; border-radius: 10px; }
.feed .stolen .badge { background: #c62828; color: #fff; }
.feed .clean .badge { background: #2e7d32; color: #fff; }
.feed .plate { font-family: monospace; font-weight: 700; }
.feed .meta { color: #5b6b7d; font-size: 0.85em; margin-left: auto; }
.history li { padding: 4px 0; }
"#;

const DASHBOARD_JS: &str = r#"
const charts = {};

function drawChart(id, type, data, label) {
    if (charts[id]) {
        charts[id].destroy();
    }
    charts[id] = new Chart(document.getElementById(id), {
        type: type,
        data: { labels: data.labels, datasets: [{ label: label, data: data.values }] },
        options: { responsive: true },
    });
}

async function loadCharts() {
    const res = await fetch('/dashboard/aggregates');
    if (!res.ok) return;
    const agg = await res.json();
    drawChart('detections-chart', 'bar', agg.detectionsByMonth, 'Détections');
    drawChart('status-chart', 'doughnut', agg.vehiclesByStatus, 'Véhicules');
}

const feed = new EventSource('/dashboard/notifications');
// Every push means the detections changed, so the charts are redrawn too
feed.onmessage = (event) => {
    document.getElementById('feed').innerHTML = event.data;
    loadCharts();
};
"#;
