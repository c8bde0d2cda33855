// growerd: Diagnostics dashboard page
//
// A single self-contained HTML page: auto-scrolling log viewer fed by the
// SSE stream, level filter, download, and the emergency-stop trigger.

pub const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>growerd diagnostics</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body { background: #0d1117; color: #c9d1d9; font-family: 'SF Mono', 'Fira Code', 'Consolas', monospace; font-size: 13px; }
  .header { background: #161b22; padding: 12px 20px; border-bottom: 1px solid #30363d; display: flex; justify-content: space-between; align-items: center; position: sticky; top: 0; z-index: 10; }
  .header h1 { font-size: 16px; color: #58a6ff; }
  .header .status { display: flex; gap: 12px; align-items: center; }
  .controls { background: #161b22; padding: 8px 20px; border-bottom: 1px solid #30363d; display: flex; gap: 10px; align-items: center; flex-wrap: wrap; }
  .controls button { background: #21262d; color: #c9d1d9; border: 1px solid #30363d; padding: 4px 12px; border-radius: 6px; cursor: pointer; font-size: 12px; }
  .controls button:hover { background: #30363d; }
  .controls button.danger { background: #da3633; color: white; border-color: #f85149; }
  .controls button.danger:hover { background: #f85149; }
  .controls select { background: #21262d; color: #c9d1d9; border: 1px solid #30363d; padding: 4px 8px; border-radius: 6px; font-size: 12px; }
  .dot { width: 8px; height: 8px; border-radius: 50%; display: inline-block; }
  .dot.green { background: #3fb950; }
  .dot.red { background: #f85149; }
  #log-container { padding: 10px 20px; overflow-y: auto; height: calc(100vh - 100px); }
  .log-line { padding: 2px 0; white-space: pre-wrap; word-break: break-all; line-height: 1.5; border-bottom: 1px solid #21262d; }
  .log-line:hover { background: #161b22; }
  .level-ERROR { color: #f85149; }
  .level-WARN { color: #d29922; }
  .level-INFO { color: #c9d1d9; }
  .level-DEBUG, .level-TRACE { color: #8b949e; }
  .timestamp { color: #8b949e; }
  .target-name { color: #7ee787; }
  #stats { font-size: 11px; color: #8b949e; }
</style>
</head>
<body>
<div class="header">
  <h1>growerd diagnostics</h1>
  <div class="status">
    <span id="stats">connecting...</span>
    <span class="dot" id="status-dot"></span>
  </div>
</div>
<div class="controls">
  <button onclick="clearLogs()">Clear</button>
  <button onclick="toggleAutoScroll()" id="btn-scroll">Auto-scroll: ON</button>
  <select id="level-filter" onchange="applyFilter()">
    <option value="">All Levels</option>
    <option value="ERROR">ERROR</option>
    <option value="WARN">WARN</option>
    <option value="INFO">INFO</option>
    <option value="DEBUG">DEBUG</option>
  </select>
  <button onclick="downloadLogs()">Download</button>
  <button class="danger" onclick="emergencyStop()">EMERGENCY STOP</button>
  <a href="/api/gpio" target="_blank" style="color:#58a6ff;text-decoration:none;font-size:12px;">GPIO State</a>
  <a href="/api/health" target="_blank" style="color:#58a6ff;text-decoration:none;font-size:12px;">Health</a>
</div>
<div id="log-container"></div>
<script>
const container = document.getElementById('log-container');
const statusDot = document.getElementById('status-dot');
const stats = document.getElementById('stats');
let autoScroll = true;
let lineCount = 0;
let levelFilter = '';

function addLogLine(entry) {
  if (levelFilter && entry.level !== levelFilter) return;
  const div = document.createElement('div');
  div.className = 'log-line level-' + entry.level;
  div.innerHTML = '<span class="timestamp">' + escHtml(entry.timestamp) + '</span> '
    + '<span class="target-name">' + escHtml(entry.target) + '</span> '
    + '<b>' + entry.level + '</b> '
    + escHtml(entry.message);
  container.appendChild(div);
  lineCount++;
  if (lineCount > 5000) { container.removeChild(container.firstChild); lineCount--; }
  if (autoScroll) container.scrollTop = container.scrollHeight;
}

function escHtml(s) { const d = document.createElement('div'); d.textContent = s || ''; return d.innerHTML; }

function clearLogs() { container.innerHTML = ''; lineCount = 0; }

function toggleAutoScroll() {
  autoScroll = !autoScroll;
  document.getElementById('btn-scroll').textContent = 'Auto-scroll: ' + (autoScroll ? 'ON' : 'OFF');
  if (autoScroll) container.scrollTop = container.scrollHeight;
}

function applyFilter() {
  levelFilter = document.getElementById('level-filter').value;
  container.innerHTML = '';
  lineCount = 0;
  fetch('/api/logs?count=500' + (levelFilter ? '&level=' + levelFilter : ''))
    .then(r => r.json())
    .then(data => data.logs.forEach(addLogLine));
}

function downloadLogs() {
  fetch('/api/logs?count=2000')
    .then(r => r.json())
    .then(data => {
      const text = data.logs.map(l => l.formatted).join('\n');
      const blob = new Blob([text], { type: 'text/plain' });
      const a = document.createElement('a');
      a.href = URL.createObjectURL(blob);
      a.download = 'growerd-logs-' + new Date().toISOString().slice(0,19).replace(/:/g,'-') + '.txt';
      a.click();
    });
}

function emergencyStop() {
  if (confirm('EMERGENCY STOP - this will turn ALL pins OFF immediately. Continue?')) {
    fetch('/api/emergency-stop', { method: 'POST' })
      .then(r => r.json())
      .then(data => alert('Emergency stop executed: ' + JSON.stringify(data)))
      .catch(e => alert('Emergency stop failed: ' + e));
  }
}

let evtSource;
function connectSSE() {
  evtSource = new EventSource('/api/logs/stream');
  evtSource.onmessage = (e) => {
    try {
      const entry = JSON.parse(e.data);
      addLogLine(entry);
      stats.textContent = lineCount + ' lines | live';
      statusDot.className = 'dot green';
    } catch(err) {}
  };
  evtSource.onerror = () => {
    statusDot.className = 'dot red';
    stats.textContent = 'disconnected - reconnecting...';
    evtSource.close();
    setTimeout(connectSSE, 3000);
  };
  evtSource.onopen = () => {
    statusDot.className = 'dot green';
    stats.textContent = 'connected';
  };
}
connectSSE();
</script>
</body>
</html>"#;
